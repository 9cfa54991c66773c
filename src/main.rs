use std::sync::Arc;

use log::{error, info, warn};

use ble_telemetry_bridge::bluetooth::{
    BluezRadio, PeripheralFilter, PeripheralSession, SessionOptions,
};
use ble_telemetry_bridge::config::{self, DeviceConfig};
use ble_telemetry_bridge::mqtt::{self, LogHandler, MqttBridge};
use ble_telemetry_bridge::utils::{init_logging, shutdown_signal};

const CLIENT_ID: &str = "bluetooth-temp";

async fn main_loop(
    config: DeviceConfig,
    bridge: Arc<MqttBridge>,
) -> Result<(), Box<dyn std::error::Error>> {
    let radio = Arc::new(BluezRadio::new().await?);

    let options = SessionOptions {
        topic: mqtt::publish_topic(&config.mqtt.topic),
        qos: mqtt::qos_from_level(config.mqtt.qos),
        dwell: config.dwell,
        cooldown: config.cooldown,
    };
    info!("Publishing readings to {}", options.topic);

    let filter = PeripheralFilter::new(&config.name, &config.mac_address);
    let session = PeripheralSession::new(radio, bridge, filter, options);
    session.run().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(config::debug_enabled());
    info!(
        "Starting bluetooth device adaptor v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = match DeviceConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let bridge = match MqttBridge::connect(CLIENT_ID, &config.mqtt.server).await {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            error!("Failed to connect to the mqtt server, err: {}", e);
            return Err(e.into());
        }
    };

    // Echo everything published below the device topic
    let echo_filter = mqtt::subscribe_filter(&config.mqtt.topic);
    let qos = mqtt::qos_from_level(config.mqtt.qos);
    if let Err(e) = bridge.subscribe(&echo_filter, qos, Arc::new(LogHandler)).await {
        error!("Failed to subscribe the mqtt server, err: {}", e);
        return Err(e.into());
    }

    // Run main loop or wait for shutdown signal
    let result = tokio::select! {
        result = main_loop(config, Arc::clone(&bridge)) => result,
        _ = shutdown_signal() => {
            info!("Program terminated by user. Exiting gracefully.");
            Ok(())
        }
    };

    if let Err(e) = bridge.disconnect().await {
        warn!("{}", e);
    }

    if let Err(e) = &result {
        error!("Fatal error: {}", e);
    }
    result
}
