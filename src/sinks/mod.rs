// src/sinks/mod.rs
//
// Telemetry sinks shipped with the ground station.
//
// - csv_log.rs - append-only flight log, one row per sensor reading
// - console.rs - human-readable frame and status lines through tlog!

pub mod console;
pub mod csv_log;

pub use console::{format_frame, format_reading, ConsoleSink};
pub use csv_log::{CsvSink, CSV_FIXED_COLUMNS};
