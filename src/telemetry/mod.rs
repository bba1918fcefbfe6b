// src/telemetry/mod.rs
//
// Telemetry decoding: +RCV modem line -> typed sensor readings.
//
// - payload.rs - base64 payload codec
// - schema.rs  - sensor id -> decoding rule registry
// - frame.rs   - line decomposition and the record loop
//
// Everything here is pure and synchronous; the link session calls it per line.

pub mod frame;
pub mod payload;
pub mod schema;

pub use frame::{
    decode_records, encode_records, reading_from_values, DecodedFrame, FrameAdvisory,
    FrameDecoder, FrameError, FrameMetadata, SensorReading, DEFAULT_MARKER,
};
pub use payload::{decode_payload, encode_payload, DecodeError};
pub use schema::{Encoding, SensorSchema};
