// src/telemetry/payload.rs
//
// Base64 payload codec for the third field of a +RCV line.
// The radio firmware base64-encodes the binary record stream so it survives the
// modem's ASCII-only AT interface.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

/// Failure to turn the payload text back into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Invalid base64 alphabet or padding
    #[error("malformed base64 payload: {0}")]
    Malformed(String),
}

/// Decode the base64 payload field into the raw record buffer.
///
/// Surrounding whitespace is ignored. An empty field decodes to an empty buffer,
/// which the frame decoder turns into an empty reading list.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encode a raw record buffer as it appears on the wire.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
