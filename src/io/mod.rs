// src/io/mod.rs
//
// I/O layer: transport errors and the serial transport.
// Link state and session orchestration live in crate::link.

mod error;
pub mod serial;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::IoError;
pub use serial::{
    list_serial_ports, LineFramer, LinkPort, Parity, PortProvider, PortTarget, SerialLine,
    SerialPortInfo, SerialPortProvider,
};

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
