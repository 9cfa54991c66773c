/// Utility functions for payload rendering, numeric scraping and timestamps
use std::fmt::Write;
use std::sync::OnceLock;

use log::warn;
use regex::Regex;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::signal::unix::{signal, SignalKind};

// Signed decimal with optional thousands separators and one decimal point
const NUMBER_PATTERN: &str = r"-?\d+(?:,\d+)*(?:\.\d+)?";

/// Initialise `env_logger` the same way for both binaries
pub fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Current UTC time in nanoseconds since the Unix epoch
pub fn now_nanos() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

/// Render raw bytes as a double-quoted, escaped string
///
/// Printable text is kept as is; quotes, backslashes and the usual control
/// characters get backslash escapes; everything else, including bytes that
/// are not valid UTF-8, is written as `\xNN`.
pub fn render_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');

    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                push_escaped(&mut out, text);
                break;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                if let Ok(text) = std::str::from_utf8(valid) {
                    push_escaped(&mut out, text);
                }
                let bad_len = e.error_len().unwrap_or(invalid.len());
                for byte in &invalid[..bad_len] {
                    let _ = write!(out, "\\x{:02x}", byte);
                }
                rest = &invalid[bad_len..];
            }
        }
    }

    out.push('"');
    out
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

/// Lowercase hex dump without separators, e.g. `0a1b`
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// Uppercase hex dump with spaces between bytes, e.g. `0A 1B`
pub fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract every decimal-looking substring, in order of appearance
///
/// The matches are returned verbatim; no numeric parsing happens here.
///
/// # Arguments
/// * `text` - Raw text of a reading
///
/// # Returns
/// Vector of matched substrings, e.g. `["23.5", "60"]` for
/// `temp=23.5, humid="60%"`
pub fn extract_numbers(text: &str) -> Vec<&str> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(NUMBER_PATTERN).expect("valid number pattern"));
    re.find_iter(text).map(|m| m.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_printable_text() {
        assert_eq!(render_bytes(b"temp=23.5"), "\"temp=23.5\"");
        assert_eq!(render_bytes(b""), "\"\"");
    }

    #[test]
    fn test_render_escapes_quotes_and_controls() {
        assert_eq!(
            render_bytes(b"temp=23.5, humid=\"60%\""),
            r#""temp=23.5, humid=\"60%\"""#
        );
        assert_eq!(render_bytes(b"a\\b\n\t\r"), r#""a\\b\n\t\r""#);
        assert_eq!(render_bytes(&[0x00, 0x1f, 0x7f]), r#""\x00\x1f\x7f""#);
    }

    #[test]
    fn test_render_invalid_utf8() {
        assert_eq!(render_bytes(&[b'o', b'k', 0xff, 0xfe]), r#""ok\xff\xfe""#);
        assert_eq!(render_bytes("25°C".as_bytes()), "\"25°C\"");
    }

    #[test]
    fn test_hex_dumps() {
        assert_eq!(hex_bytes(&[0x0a, 0x1b, 0xff]), "0a1bff");
        assert_eq!(spaced_hex(&[0x0a, 0x1b, 0xff]), "0A 1B FF");
        assert_eq!(spaced_hex(&[]), "");
    }

    #[test]
    fn test_extract_numbers_in_order() {
        let raw = render_bytes(b"temp=23.5, humid=\"60%\"");
        assert_eq!(extract_numbers(&raw), vec!["23.5", "60"]);
    }

    #[test]
    fn test_extract_numbers_keeps_literal_text() {
        assert_eq!(
            extract_numbers("t=-3,200.50 h=007"),
            vec!["-3,200.50", "007"]
        );
    }

    #[test]
    fn test_extract_numbers_ignores_trailing_separators() {
        assert_eq!(extract_numbers("23, 60."), vec!["23", "60"]);
        assert!(extract_numbers("no digits here").is_empty());
    }

    #[test]
    fn test_format_datetime() {
        let dt = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(format_datetime(&dt), "05.03.2024 - 07:08:09");
    }
}
