/// Database operations for storing scraped readings
use async_trait::async_trait;
use log::{error, info};

use crate::config::SinkConfig;
use crate::database::connection::InfluxClient;
use crate::database::line_protocol::to_line;
use crate::error::SinkError;
use crate::models::DataPoint;

/// Something that can persist one point
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write_point(&self, sink: &SinkConfig, point: &DataPoint) -> Result<(), SinkError>;
}

#[async_trait]
impl PointWriter for InfluxClient {
    async fn write_point(&self, sink: &SinkConfig, point: &DataPoint) -> Result<(), SinkError> {
        self.write_lines(sink, to_line(point)).await
    }
}

/// Best-effort writer with fixed destination and metadata
pub struct TimeSeriesSink<W> {
    writer: W,
    config: SinkConfig,
}

impl<W: PointWriter> TimeSeriesSink<W> {
    pub fn new(writer: W, config: SinkConfig) -> Self {
        TimeSeriesSink { writer, config }
    }

    /// Build the point for one temperature/humidity pair
    pub fn point(&self, temperature: &str, humid: &str, time_nanos: i64) -> DataPoint {
        DataPoint {
            measurement: self.config.measurement.clone(),
            tags: vec![("name".to_string(), self.config.tag_name.clone())],
            fields: vec![
                ("temperature".to_string(), temperature.to_string()),
                ("humid".to_string(), humid.to_string()),
            ],
            time_nanos,
        }
    }

    /// Store atmospheric sensor data (temperature, humidity) in database
    ///
    /// Single attempt, no retry. Failures are logged and swallowed so the
    /// caller can move on to the next message.
    pub async fn write(&self, point: &DataPoint) {
        match self.writer.write_point(&self.config, point).await {
            Ok(()) => info!("success write data into the influxDB"),
            Err(e) => error!("failed to write to influxDB with err: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::RecordingWriter;
    use super::*;

    #[test]
    fn test_point_uses_configured_metadata() {
        let sink = TimeSeriesSink::new(
            RecordingWriter::new(),
            SinkConfig {
                measurement: "climate".to_string(),
                tag_name: "hall".to_string(),
                ..SinkConfig::default()
            },
        );

        let point = sink.point("21.0", "40", 7);
        assert_eq!(point.measurement, "climate");
        assert_eq!(point.tag("name"), Some("hall"));
        assert_eq!(point.field("temperature"), Some("21.0"));
        assert_eq!(point.field("humid"), Some("40"));
        assert_eq!(point.time_nanos, 7);
    }

    #[tokio::test]
    async fn test_write_failure_is_single_attempt() {
        let writer = RecordingWriter::new();
        writer.fail_next(1);
        let sink = TimeSeriesSink::new(writer.clone(), SinkConfig::default());

        sink.write(&sink.point("1", "2", 3)).await;

        assert_eq!(writer.get_attempts(), 1);
        assert!(writer.get_points().is_empty());
    }
}
