//! # BLE telemetry bridge
//!
//! Moves temperature/humidity readings from a Bluetooth LE peripheral onto an
//! MQTT topic (`device-bridge`) and from MQTT into InfluxDB (`db-metrics`).

pub mod bluetooth;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod utils;
