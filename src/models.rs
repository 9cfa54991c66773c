use serde::{Deserialize, Serialize};

use crate::utils::now_nanos;

/// One telemetry message as it travels over MQTT.
///
/// The JSON keys stay `PropertyName`/`Result`/`TimeStamp` so existing
/// producers and consumers on the bus keep interoperating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "PropertyName")]
    pub property_name: String,
    #[serde(rename = "Result")]
    pub raw_result: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp_nanos: i64,
}

impl Reading {
    /// Build a reading stamped with the current UTC time.
    pub fn new(property_name: &str, raw_result: String) -> Self {
        Self {
            property_name: property_name.to_string(),
            raw_result,
            timestamp_nanos: now_nanos(),
        }
    }
}

/// One point written to the time-series store.
///
/// Tags and fields keep insertion order; field values are the literal text
/// scraped from the reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, String)>,
    pub time_nanos: i64,
}

impl DataPoint {
    pub fn tag(&self, key: &str) -> Option<&str> {
        lookup(&self.tags, key)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        lookup(&self.fields, key)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_reading_is_stamped_now() {
        let before = now_nanos();
        let reading = Reading::new("temp-data", "\"x\"".to_string());
        let after = now_nanos();

        assert_eq!(reading.property_name, "temp-data");
        assert!(reading.timestamp_nanos >= before && reading.timestamp_nanos <= after);
    }

    #[test]
    fn test_point_lookup() {
        let point = DataPoint {
            measurement: "temperature".to_string(),
            tags: vec![("name".to_string(), "temp".to_string())],
            fields: vec![
                ("temperature".to_string(), "23.5".to_string()),
                ("humid".to_string(), "60".to_string()),
            ],
            time_nanos: 1,
        };

        assert_eq!(point.tag("name"), Some("temp"));
        assert_eq!(point.field("humid"), Some("60"));
        assert_eq!(point.field("pressure"), None);
    }
}
