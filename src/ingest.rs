/// MQTT -> InfluxDB consumer.
///
/// Every message is decoded, the first two numbers in its raw text become
/// the `temperature` and `humid` fields, and one point is written. Anything
/// that goes wrong is logged and the message is dropped.
use async_trait::async_trait;
use log::{error, info, warn};

use crate::codec;
use crate::database::{PointWriter, TimeSeriesSink};
use crate::mqtt::MessageHandler;
use crate::utils::extract_numbers;

pub struct IngestionConsumer<W> {
    sink: TimeSeriesSink<W>,
}

impl<W: PointWriter> IngestionConsumer<W> {
    pub fn new(sink: TimeSeriesSink<W>) -> Self {
        IngestionConsumer { sink }
    }

    /// Turn one bus message into at most one stored point
    ///
    /// # Arguments
    /// * `payload` - Encoded reading as received
    pub async fn process(&self, payload: &[u8]) {
        // Decode the reading
        let reading = match codec::decode(payload) {
            Ok(reading) => reading,
            Err(e) => {
                error!("{}, message: {}", e, String::from_utf8_lossy(payload));
                return;
            }
        };

        // First two numbers are temperature and humidity
        let numbers = extract_numbers(&reading.raw_result);
        let [temperature, humid, ..] = numbers.as_slice() else {
            warn!(
                "failed to sub-struct elements from string:{}, sub total len:{}.",
                reading.raw_result,
                numbers.len()
            );
            return;
        };

        let point = self.sink.point(temperature, humid, reading.timestamp_nanos);
        self.sink.write(&point).await;
    }
}

#[async_trait]
impl<W: PointWriter> MessageHandler for IngestionConsumer<W> {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        info!(
            "Subscribed MQTT topic: {}, message: {}",
            topic,
            String::from_utf8_lossy(payload)
        );
        self.process(payload).await;
    }
}
