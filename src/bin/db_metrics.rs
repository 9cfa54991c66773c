use std::sync::Arc;

use log::{error, info, warn};

use ble_telemetry_bridge::config::{self, MetricsConfig};
use ble_telemetry_bridge::database::{InfluxClient, TimeSeriesSink};
use ble_telemetry_bridge::ingest::IngestionConsumer;
use ble_telemetry_bridge::mqtt::{self, MqttBridge};
use ble_telemetry_bridge::utils::{init_logging, shutdown_signal};

const CLIENT_ID: &str = "influxDB_client";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(config::debug_enabled());
    info!("Starting db-metrics v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match MetricsConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let client = InfluxClient::new(&config.influx)?;
    if let Err(e) = client.ping().await {
        error!("failed to ping influxDB with err: {}.", e);
        return Err(e.into());
    }
    info!(
        "Writing to database {} with retention policy {}",
        config.sink.database, config.sink.retention_policy
    );

    let consumer = Arc::new(IngestionConsumer::new(TimeSeriesSink::new(
        client,
        config.sink.clone(),
    )));

    let bridge = match MqttBridge::connect(CLIENT_ID, &config.mqtt.server).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to connect to the mqtt server, err: {}", e);
            return Err(e.into());
        }
    };

    let filter = mqtt::subscribe_filter(&config.mqtt.topic);
    if let Err(e) = bridge
        .subscribe(&filter, mqtt::qos_from_level(config.mqtt.qos), consumer)
        .await
    {
        error!("Failed to subscribe the mqtt server, err: {}", e);
        return Err(e.into());
    }

    shutdown_signal().await;
    info!("Program terminated by user. Exiting gracefully.");

    // Disconnect the network connection
    if let Err(e) = bridge.disconnect().await {
        warn!("{}", e);
    }

    Ok(())
}
