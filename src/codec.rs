/// JSON framing of readings on the bus
use crate::error::{DecodeError, EncodeError};
use crate::models::Reading;

/// Serialize a reading for publishing
///
/// # Arguments
/// * `reading` - Reading to put on the bus
///
/// # Returns
/// JSON bytes with the `PropertyName`/`Result`/`TimeStamp` keys
pub fn encode(reading: &Reading) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(reading)?)
}

/// Decode a payload produced by [`encode`]. Fields are matched by key.
pub fn decode(payload: &[u8]) -> Result<Reading, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}
