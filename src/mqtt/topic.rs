/// Topic the producer publishes to: the configured topic without a trailing `/`.
pub fn publish_topic(topic: &str) -> String {
    topic.strip_suffix('/').unwrap_or(topic).to_string()
}

/// Filter matching everything one level (or more) below `topic`.
pub fn subscribe_filter(topic: &str) -> String {
    format!("{}/#", publish_topic(topic))
}

/// MQTT filter matching with `+` (one level) and `#` (this level and below).
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut levels = topic.split('/');
    for pattern in filter.split('/') {
        match pattern {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Split `host:port` (optionally prefixed with `tcp://` or `mqtt://`).
pub(crate) fn parse_server(server: &str) -> Option<(String, u16)> {
    let rest = server
        .strip_prefix("tcp://")
        .or_else(|| server.strip_prefix("mqtt://"))
        .unwrap_or(server);

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (rest, 1883),
    };

    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_topic_strips_one_trailing_slash() {
        assert_eq!(publish_topic("devices/temp/"), "devices/temp");
        assert_eq!(publish_topic("devices/temp"), "devices/temp");
    }

    #[test]
    fn test_subscribe_filter() {
        assert_eq!(subscribe_filter("devices/temp/"), "devices/temp/#");
        assert_eq!(subscribe_filter("devices"), "devices/#");
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("devices/temp", "devices/#"));
        assert!(topic_matches("devices/temp/a/b", "devices/#"));
        assert!(topic_matches("devices", "devices/#"));
        assert!(topic_matches("devices/temp", "devices/+"));
        assert!(topic_matches("devices/temp", "devices/temp"));

        assert!(!topic_matches("devices/temp/a", "devices/+"));
        assert!(!topic_matches("other/temp", "devices/#"));
        assert!(!topic_matches("devices", "devices/+"));
        assert!(!topic_matches("devices/temp", "devices"));
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("127.0.0.1:1883"), Some(("127.0.0.1".to_string(), 1883)));
        assert_eq!(parse_server("tcp://broker:1884"), Some(("broker".to_string(), 1884)));
        assert_eq!(parse_server("mqtt://broker"), Some(("broker".to_string(), 1883)));
        assert_eq!(parse_server(":1883"), None);
        assert_eq!(parse_server("broker:http"), None);
    }
}
