// src/io/serial/port.rs
//
// Port provider seam between the link session and the physical serial device.
//
// The session only needs "open this target, give me a byte stream with a read
// timeout". Closing is dropping the handle. Production code opens real ports through
// the serialport crate; tests hand the session scripted in-memory streams.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

use crate::io::error::IoError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Everything needed to open the modem's serial port
#[derive(Clone, Debug, PartialEq)]
pub struct PortTarget {
    /// Serial port path (e.g. "/dev/ttyUSB0", "/dev/cu.usbmodem1101", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Upper bound on a blocking read. Also bounds how long stop() waits.
    pub read_timeout: Duration,
}

impl PortTarget {
    /// 8-N-1 at the given baud rate with a 250 ms read timeout
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        PortTarget {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout: Duration::from_millis(250),
        }
    }

    /// Short description for log lines, e.g. `/dev/ttyUSB0 @ 115200 (8-N-1)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} ({}-{}-{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                Parity::None => 'N',
                Parity::Odd => 'O',
                Parity::Even => 'E',
            },
            self.stop_bits
        )
    }
}

/// An open, readable and writable byte stream. Dropping it closes the port.
pub trait LinkPort: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> LinkPort for T {}

/// Opens ports for the link session
pub trait PortProvider: Send {
    fn open(&mut self, target: &PortTarget) -> Result<Box<dyn LinkPort>, IoError>;
}

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

// ============================================================================
// serialport-backed provider
// ============================================================================

/// Opens real serial devices
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialPortProvider;

impl PortProvider for SerialPortProvider {
    fn open(&mut self, target: &PortTarget) -> Result<Box<dyn LinkPort>, IoError> {
        let port = serialport::new(&target.port, target.baud_rate)
            .data_bits(to_serialport_data_bits(target.data_bits))
            .stop_bits(to_serialport_stop_bits(target.stop_bits))
            .parity(to_serialport_parity(target.parity))
            .timeout(target.read_timeout)
            .open()
            .map_err(|e| IoError::open(&target.port, e))?;

        // Drop whatever the modem buffered while nobody was listening
        if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
            crate::tlog!("[serial] Could not clear input buffer on {}: {}", target.port, e);
        }

        Ok(Box::new(port))
    }
}

/// Enumerate serial ports the modem could be attached to
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports().map_err(|e| IoError::Enumerate(e.to_string()))?;

    Ok(ports
        .into_iter()
        // On macOS, only show /dev/cu.* (calling unit); /dev/tty.* blocks on open
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

// ============================================================================
// Conversion Functions
// ============================================================================

pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Unsupported widths fall back to 8 data bits
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}
