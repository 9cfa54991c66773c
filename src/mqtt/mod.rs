pub mod topic;
pub mod transport;

pub use rumqttc::QoS;
pub use topic::{publish_topic, subscribe_filter, topic_matches};
pub use transport::{LogHandler, MessageHandler, MqttBridge, Publisher};

/// Map a configured QoS level (0, 1, 2) onto the client's enum.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
