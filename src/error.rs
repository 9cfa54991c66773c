/// Error types shared by the producer and consumer binaries.
use thiserror::Error;

/// Missing or invalid startup configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("device name or device MAC address is required")]
    NoDeviceFilter,

    #[error("failed to unmarshal mqtt config {raw}: {source}")]
    MqttJson {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the MQTT bridge.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid mqtt server address {0}")]
    InvalidServer(String),

    #[error("error connecting to the mqtt server: {0}")]
    Connect(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to {filter}: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("failed to disconnect from the mqtt server: {0}")]
    Disconnect(String),
}

/// Reading could not be serialized.
#[derive(Debug, Error)]
#[error("failed to format mqtt message: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

/// Payload is not a well-formed reading.
#[derive(Debug, Error)]
#[error("failed to decode mqtt message: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// A single BLE step (scan, connect, discovery, read, subscribe) failed.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("bluetooth error: {0}")]
    Bluez(#[from] bluer::Error),

    #[error("invalid peripheral address {0}")]
    InvalidAddress(String),

    #[error("{0} is not supported by this adapter")]
    Unsupported(&'static str),

    #[error("radio event stream closed")]
    Closed,

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Failures talking to InfluxDB.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid influxDB url: {0}")]
    Url(#[from] url::ParseError),

    #[error("influxDB request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("influxDB returned {status}: {body}")]
    Status { status: u16, body: String },
}
