/// InfluxDB line protocol rendering of a [`DataPoint`]
///
/// ```text
/// measurement,tag=value field="text" timestamp_ns
/// ```
///
/// Field values are always written as string fields so the scraped text
/// reaches the store unchanged.
use crate::models::DataPoint;

pub fn to_line(point: &DataPoint) -> String {
    let mut line = escape_measurement(&point.measurement);

    for (key, value) in &point.tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    let fields: Vec<String> = point
        .fields
        .iter()
        .map(|(key, value)| format!("{}={}", escape_key(key), quote_string(value)))
        .collect();
    line.push_str(&fields.join(","));

    line.push(' ');
    line.push_str(&point.time_nanos.to_string());
    line
}

// Measurement names escape commas and spaces
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

// Tag keys, tag values and field keys also escape equals signs
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(measurement: &str, tag: &str, temperature: &str) -> DataPoint {
        DataPoint {
            measurement: measurement.to_string(),
            tags: vec![("name".to_string(), tag.to_string())],
            fields: vec![
                ("temperature".to_string(), temperature.to_string()),
                ("humid".to_string(), "60".to_string()),
            ],
            time_nanos: 1_700_000_000_000_000_001,
        }
    }

    #[test]
    fn test_line_for_reading() {
        assert_eq!(
            to_line(&point("temperature", "temp", "23.5")),
            r#"temperature,name=temp temperature="23.5",humid="60" 1700000000000000001"#
        );
    }

    #[test]
    fn test_line_escaping() {
        assert_eq!(
            to_line(&point("room temp", "a,b=c", "-3,200.50")),
            r#"room\ temp,name=a\,b\=c temperature="-3,200.50",humid="60" 1700000000000000001"#
        );
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
    }
}
