// src/io/serial/mod.rs
//
// Serial transport for the LoRa modem.
//
// - framer.rs - LF line framing with overflow resync
// - port.rs   - PortProvider seam, serialport-backed provider, port enumeration

pub mod framer;
pub mod port;

pub use framer::{FramerStats, LineFramer, SerialLine, DEFAULT_MAX_LINE_LENGTH};
pub use port::{
    list_serial_ports, LinkPort, Parity, PortProvider, PortTarget, SerialPortInfo,
    SerialPortProvider,
};
