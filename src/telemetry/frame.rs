// src/telemetry/frame.rs
//
// Telemetry frame decoder.
//
// Line format (LoRa modem receive report):
//   <marker><address>,<reported_length>,<base64_payload>,<rssi>,<snr>
//   e.g. +RCV=01,1,BQE=,-40,10
//
// Payload format (after base64): concatenated records, each
//   [sensor_id: u8][payload bytes per schema]
// with no length prefix, checksum or separator. Framing is entirely schema-driven,
// so one bad record invalidates the whole frame.

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use super::payload::{self, DecodeError};
use super::schema::{self, Encoding};

/// Marker the modem puts in front of every received packet
pub const DEFAULT_MARKER: &str = "+RCV=";

/// Number of comma-separated fields in a receive report
const REPORT_FIELDS: usize = 5;

// ============================================================================
// Types
// ============================================================================

/// Link-layer information reported alongside the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub address: String,
    /// Length claimed by the modem. None when the field was not an integer.
    pub reported_length: Option<u32>,
    /// Length of the decoded payload buffer
    pub actual_length: u32,
    /// None when the modem's value did not parse (see `FrameAdvisory::UnparsableMetadata`)
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
}

/// One decoded sensor record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_id: u8,
    pub sensor_name: String,
    /// Named values, in schema order
    pub fields: IndexMap<String, f32>,
    /// The same values without names, in wire order
    pub raw_values: Vec<f32>,
    /// Resolved label for enum-byte sensors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_label: Option<String>,
}

/// Non-fatal observation attached to a successfully decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameAdvisory {
    /// Modem-reported length disagrees with the decoded payload length
    LengthMismatch { reported: u32, actual: u32 },
    /// Modem-reported length could not be parsed as an integer
    UnparsableLength { raw: String },
    /// rssi or snr could not be parsed; the readings are still good
    UnparsableMetadata { field: &'static str, raw: String },
}

/// Output of the decoder for one modem line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    pub metadata: FrameMetadata,
    pub readings: Vec<SensorReading>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<FrameAdvisory>,
}

impl DecodedFrame {
    pub fn has_length_mismatch(&self) -> bool {
        self.advisories
            .iter()
            .any(|a| matches!(a, FrameAdvisory::LengthMismatch { .. }))
    }
}

/// Why a line did not produce a frame. Every variant is frame-scoped: the link
/// stays up and the next line is decoded from scratch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    /// No marker in the line. Diagnostic chatter on a shared serial channel, not data loss.
    #[error("line is not a telemetry report")]
    NotATelemetryLine,
    #[error("malformed report: expected {expected} fields, got {got}")]
    MalformedLine { expected: usize, got: usize },
    #[error("payload decode failed: {0}")]
    PayloadDecodeFailed(#[from] DecodeError),
    #[error("unknown sensor id {0}")]
    UnknownSensorId(u8),
    #[error("truncated {sensor_name} record: need {needed} bytes, have {available}")]
    TruncatedRecord {
        sensor_name: String,
        needed: usize,
        available: usize,
    },
    /// Only produced when re-encoding readings
    #[error("cannot encode {sensor_name}: {reason}")]
    Unencodable { sensor_name: String, reason: String },
}

impl FrameError {
    /// True for lines that were never telemetry to begin with
    pub fn is_noise(&self) -> bool {
        matches!(self, FrameError::NotATelemetryLine)
    }
}

/// Raw fields of a receive report, borrowed from the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFields<'a> {
    pub address: &'a str,
    pub reported_length: &'a str,
    pub payload: &'a str,
    pub rssi: &'a str,
    pub snr: &'a str,
}

// ============================================================================
// Decoder
// ============================================================================

/// Stateless decoder for modem receive reports. Cheap to clone and safe to
/// share between threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDecoder {
    marker: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_MARKER)
    }
}

impl FrameDecoder {
    pub fn new(marker: impl Into<String>) -> Self {
        FrameDecoder {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Decode one modem line into a frame.
    ///
    /// Examples:
    ///   `+RCV=01,1,BQE=,-40,10` -> Rocket_State reading labelled IDLE
    ///   `Received: +RCV=...`    -> text before the marker is ignored
    ///   `OK`                    -> `FrameError::NotATelemetryLine`
    pub fn decode_line(&self, line: &str) -> Result<DecodedFrame, FrameError> {
        let report = self.split_line(line)?;

        let bytes = payload::decode_payload(report.payload)?;
        let actual_length = bytes.len() as u32;

        let mut advisories = Vec::new();
        let rssi = parse_metadata::<i32>("rssi", report.rssi, &mut advisories);
        let snr = parse_metadata::<f32>("snr", report.snr, &mut advisories);
        let reported_length = match report.reported_length.parse::<u32>() {
            Ok(reported) => {
                if reported != actual_length {
                    advisories.push(FrameAdvisory::LengthMismatch {
                        reported,
                        actual: actual_length,
                    });
                }
                Some(reported)
            }
            Err(_) => {
                advisories.push(FrameAdvisory::UnparsableLength {
                    raw: report.reported_length.to_string(),
                });
                None
            }
        };

        let readings = decode_records(&bytes)?;

        Ok(DecodedFrame {
            metadata: FrameMetadata {
                address: report.address.to_string(),
                reported_length,
                actual_length,
                rssi,
                snr,
            },
            readings,
            advisories,
        })
    }

    /// Locate the marker and split the report into its five fields.
    /// Fields past the fifth are ignored.
    pub fn split_line<'a>(&self, line: &'a str) -> Result<ReportFields<'a>, FrameError> {
        let (_, body) = line
            .split_once(self.marker.as_str())
            .ok_or(FrameError::NotATelemetryLine)?;

        let parts: Vec<&str> = body.split(',').map(str::trim).collect();
        if parts.len() < REPORT_FIELDS {
            return Err(FrameError::MalformedLine {
                expected: REPORT_FIELDS,
                got: parts.len(),
            });
        }

        Ok(ReportFields {
            address: parts[0],
            reported_length: parts[1],
            payload: parts[2],
            rssi: parts[3],
            snr: parts[4],
        })
    }

    /// Build a modem line carrying the given readings. The reported length is the
    /// true encoded length.
    pub fn encode_line(
        &self,
        address: &str,
        readings: &[SensorReading],
        rssi: i32,
        snr: f32,
    ) -> Result<String, FrameError> {
        let bytes = encode_records(readings)?;
        Ok(format!(
            "{}{},{},{},{},{}",
            self.marker,
            address,
            bytes.len(),
            payload::encode_payload(&bytes),
            rssi,
            snr
        ))
    }
}

fn parse_metadata<T: std::str::FromStr>(
    field: &'static str,
    raw: &str,
    advisories: &mut Vec<FrameAdvisory>,
) -> Option<T> {
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            advisories.push(FrameAdvisory::UnparsableMetadata {
                field,
                raw: raw.to_string(),
            });
            None
        }
    }
}

// ============================================================================
// Record Loop
// ============================================================================

/// Walk the payload buffer record by record.
///
/// Succeeds only when the last record ends exactly at the end of the buffer. An
/// unknown id or a record that runs past the end rejects the whole buffer, since
/// there is no way to resynchronise after a misaligned record.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<SensorReading>, FrameError> {
    let mut readings = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let sensor_id = bytes[offset];
        offset += 1;

        let schema = schema::lookup(sensor_id).ok_or(FrameError::UnknownSensorId(sensor_id))?;

        let needed = schema.payload_len();
        let available = bytes.len() - offset;
        if needed > available {
            return Err(FrameError::TruncatedRecord {
                sensor_name: schema.name.to_string(),
                needed,
                available,
            });
        }
        let record = &bytes[offset..offset + needed];

        let mut fields = IndexMap::new();
        let mut raw_values = Vec::new();
        let mut enum_label = None;

        match schema.encoding {
            Encoding::FloatList(_) => {
                for (i, chunk) in record.chunks_exact(4).enumerate() {
                    let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    fields.insert(schema.field_name(i).into_owned(), value);
                    raw_values.push(value);
                }
            }
            Encoding::EnumByte(_) => {
                let byte = record[0];
                fields.insert(schema.field_name(0).into_owned(), byte as f32);
                raw_values.push(byte as f32);
                enum_label = schema.encoding.resolve_label(byte).map(|l| l.into_owned());
            }
        }

        readings.push(SensorReading {
            sensor_id,
            sensor_name: schema.name.to_string(),
            fields,
            raw_values,
            enum_label,
        });
        offset += needed;
    }

    Ok(readings)
}

/// Inverse of [`decode_records`]: serialise readings back into the record stream.
pub fn encode_records(readings: &[SensorReading]) -> Result<Vec<u8>, FrameError> {
    let mut bytes = Vec::new();

    for reading in readings {
        let schema =
            schema::lookup(reading.sensor_id).ok_or(FrameError::UnknownSensorId(reading.sensor_id))?;
        let unencodable = |reason: String| FrameError::Unencodable {
            sensor_name: schema.name.to_string(),
            reason,
        };

        bytes.push(reading.sensor_id);
        match schema.encoding {
            Encoding::FloatList(count) => {
                if reading.raw_values.len() != count as usize {
                    return Err(unencodable(format!(
                        "expected {} values, got {}",
                        count,
                        reading.raw_values.len()
                    )));
                }
                for value in &reading.raw_values {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
            }
            Encoding::EnumByte(_) => {
                let byte = match reading.raw_values.as_slice() {
                    [value] => enum_byte(*value),
                    _ => None,
                };
                let byte = byte.ok_or_else(|| {
                    unencodable(format!(
                        "expected one byte value, got {:?}",
                        reading.raw_values
                    ))
                })?;
                bytes.push(byte);
            }
        }
    }

    Ok(bytes)
}

/// Whole number in 0..=255, the only values an enum byte can carry
fn enum_byte(value: f32) -> Option<u8> {
    if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

/// Build a reading from raw values the way the decoder would. Used by the line
/// encoder and by tests.
pub fn reading_from_values(sensor_id: u8, values: &[f32]) -> Result<SensorReading, FrameError> {
    let schema = schema::lookup(sensor_id).ok_or(FrameError::UnknownSensorId(sensor_id))?;
    let expected = match schema.encoding {
        Encoding::FloatList(count) => count as usize,
        Encoding::EnumByte(_) => 1,
    };
    if values.len() != expected {
        return Err(FrameError::Unencodable {
            sensor_name: schema.name.to_string(),
            reason: format!("expected {} values, got {}", expected, values.len()),
        });
    }

    let mut record = vec![sensor_id];
    match schema.encoding {
        Encoding::FloatList(_) => {
            for value in values {
                record.extend_from_slice(&value.to_le_bytes());
            }
        }
        Encoding::EnumByte(_) => {
            let byte = enum_byte(values[0]).ok_or_else(|| FrameError::Unencodable {
                sensor_name: schema.name.to_string(),
                reason: format!("{} is not a byte value", values[0]),
            })?;
            record.push(byte);
        }
    }

    let mut readings = decode_records(&record)?;
    Ok(readings.remove(0))
}
