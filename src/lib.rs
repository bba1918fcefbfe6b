// src/lib.rs
//
// groundlink: ground-station receiver for LoRa rocket telemetry.
//
// - telemetry - modem line and binary payload decoding (pure)
// - io        - serial transport and its error type
// - link      - session thread, link state machine, sink delivery
// - sinks     - CSV flight log and console output
// - settings  - TOML configuration
// - logging   - timestamped console/file logging (`tlog!`)

#[macro_use]
pub mod logging;

pub mod io;
pub mod link;
pub mod settings;
pub mod sinks;
pub mod telemetry;

pub use io::{list_serial_ports, IoError, PortTarget, SerialPortInfo};
pub use link::{LinkSession, LinkState, SessionOptions, TelemetrySink};
pub use settings::LinkSettings;
pub use telemetry::{DecodedFrame, FrameDecoder, FrameError, SensorReading};
