// src/io/error.rs
//
// Error type for everything that touches the outside world: serial ports,
// log files and configuration. Decode failures live in telemetry::FrameError.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    /// Port could not be opened (missing device, busy, permissions)
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// Port enumeration failed
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(String),

    /// Settings file missing, unreadable or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Command sent to a link session that already stopped
    #[error("link session has stopped")]
    SessionStopped,

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IoError {
    pub fn open(port: impl Into<String>, reason: impl ToString) -> Self {
        IoError::Open {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(reason: impl ToString) -> Self {
        IoError::Config(reason.to_string())
    }
}
