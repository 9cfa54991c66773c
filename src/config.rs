use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_DWELL_SECS: u64 = 5;
const DEFAULT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_MQTT_SERVER: &str = "127.0.0.1:1883";

/// MQTT settings of the device bridge, given inline as `DEVICE_MQTT` JSON
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttConfig {
    #[serde(alias = "Server")]
    pub server: String,
    #[serde(alias = "Topic")]
    pub topic: String,
    #[serde(default, alias = "Qos")]
    pub qos: u8,
}

impl MqttConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mqtt: MqttConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::MqttJson {
                raw: raw.to_string(),
                source,
            })?;
        check_qos(mqtt.qos)?;
        Ok(mqtt)
    }
}

/// Settings of the device bridge
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub mac_address: String,
    pub mqtt: MqttConfig,
    pub dwell: Duration,
    pub cooldown: Duration,
}

impl DeviceConfig {
    /// Load the device bridge settings from `.env` and the environment
    ///
    /// # Returns
    /// Result containing the settings, or the first missing or invalid value
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse the device bridge settings
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, None when unset
    ///
    /// # Returns
    /// Result containing the settings. At least one of `DEVICE_NAME` and
    /// `DEVICE_MAC_ADDRESS` must be set, and `DEVICE_MQTT` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Peripheral filter
        let name = lookup("DEVICE_NAME").unwrap_or_default();
        let mac_address = lookup("DEVICE_MAC_ADDRESS").unwrap_or_default();
        if name.is_empty() && mac_address.is_empty() {
            return Err(ConfigError::NoDeviceFilter);
        }

        // Inline broker settings
        let raw_mqtt = lookup("DEVICE_MQTT")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("DEVICE_MQTT"))?;
        let mqtt = MqttConfig::from_json(&raw_mqtt)?;

        let dwell = secs(&lookup, "DWELL_SECS", DEFAULT_DWELL_SECS)?;
        let cooldown = secs(&lookup, "COOLDOWN_SECS", DEFAULT_COOLDOWN_SECS)?;

        Ok(DeviceConfig {
            name,
            mac_address,
            mqtt,
            dwell,
            cooldown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Where and how points land in InfluxDB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub database: String,
    pub retention_policy: String,
    pub measurement: String,
    pub tag_name: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            database: "mydb".to_string(),
            retention_policy: "autogen".to_string(),
            measurement: "temperature".to_string(),
            tag_name: "temp".to_string(),
        }
    }
}

/// Settings of the db-metrics consumer
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub influx: InfluxConfig,
    pub sink: SinkConfig,
    pub mqtt: MqttConfig,
}

impl MetricsConfig {
    /// Load the db-metrics settings from `.env` and the environment
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // InfluxDB server, all required
        let influx = InfluxConfig {
            server: required(&lookup, "INFLUXDB_SERVER")?,
            port: port(&lookup)?,
            username: required(&lookup, "INFLUXDB_USERNAME")?,
            password: required(&lookup, "INFLUXDB_PASSWORD")?,
        };

        // Destination, defaulted
        let defaults = SinkConfig::default();
        let sink = SinkConfig {
            database: optional(&lookup, "DATABASE").unwrap_or(defaults.database),
            retention_policy: optional(&lookup, "RETENTION_POLICY")
                .unwrap_or(defaults.retention_policy),
            measurement: optional(&lookup, "MEASUREMENT").unwrap_or(defaults.measurement),
            tag_name: optional(&lookup, "TAG_NAME").unwrap_or(defaults.tag_name),
        };

        // Broker
        let qos = match optional(&lookup, "MQTT_QOS") {
            Some(raw) => raw.parse::<u8>().map_err(|e| ConfigError::Invalid {
                name: "MQTT_QOS",
                reason: e.to_string(),
            })?,
            None => 0,
        };
        check_qos(qos)?;
        let mqtt = MqttConfig {
            server: optional(&lookup, "MQTT_SERVER")
                .unwrap_or_else(|| DEFAULT_MQTT_SERVER.to_string()),
            topic: required(&lookup, "MQTT_TOPIC")?,
            qos,
        };

        Ok(MetricsConfig { influx, sink, mqtt })
    }
}

/// `DEBUG=1` or `DEBUG=true` switches both binaries to debug logging
pub fn debug_enabled() -> bool {
    dotenv::dotenv().ok();
    env::var("DEBUG")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or(ConfigError::Missing(key))
}

fn port<F>(lookup: &F) -> Result<u16, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = required(lookup, "INFLUXDB_PORT")?;
    match raw.parse::<u16>() {
        Ok(0) => Err(ConfigError::Invalid {
            name: "INFLUXDB_PORT",
            reason: "port must not be 0".to_string(),
        }),
        Ok(port) => Ok(port),
        Err(e) => Err(ConfigError::Invalid {
            name: "INFLUXDB_PORT",
            reason: e.to_string(),
        }),
    }
}

fn secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match optional(lookup, key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                name: key,
                reason: e.to_string(),
            }),
        None => Ok(Duration::from_secs(default)),
    }
}

fn check_qos(qos: u8) -> Result<(), ConfigError> {
    if qos > 2 {
        return Err(ConfigError::Invalid {
            name: "qos",
            reason: format!("{} is not one of 0, 1, 2", qos),
        });
    }
    Ok(())
}
