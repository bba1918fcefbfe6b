// src/sinks/csv_log.rs
//
// Flight log: every decoded reading appended to a CSV file as it arrives.
//
// File: <dir>/Flight_Data_<YYYY-mm-dd_HH-MM-SS>.csv
// Columns: host_time, address, rssi, snr, sensor_id, sensor_name, state_label,
//          then one column per known sensor field (blank when the reading lacks it).
// Rows are flushed per frame so a crash loses at most the frame being written.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::io::IoError;
use crate::link::{LinkState, TelemetrySink};
use crate::telemetry::{schema, DecodedFrame, FrameError};

pub const CSV_FIXED_COLUMNS: &[&str] = &[
    "host_time",
    "address",
    "rssi",
    "snr",
    "sensor_id",
    "sensor_name",
    "state_label",
];

pub struct CsvSink {
    writer: csv::Writer<File>,
    path: PathBuf,
    field_columns: Vec<&'static str>,
    rows_written: u64,
    /// Set after a write error so a full disk logs once, not once per frame
    failing: bool,
}

impl CsvSink {
    /// Create a new timestamped flight log in `dir`, creating the directory if needed
    pub fn create(dir: &Path) -> Result<Self, IoError> {
        std::fs::create_dir_all(dir)?;
        let filename = chrono::Local::now()
            .format("Flight_Data_%Y-%m-%d_%H-%M-%S.csv")
            .to_string();
        Self::create_file(&dir.join(filename))
    }

    /// Create (or truncate) a flight log at an exact path
    pub fn create_file(path: &Path) -> Result<Self, IoError> {
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(file);

        let field_columns = schema::known_field_names();
        let header: Vec<&str> = CSV_FIXED_COLUMNS
            .iter()
            .copied()
            .chain(field_columns.iter().copied())
            .collect();
        writer.write_record(&header)?;
        writer.flush()?;

        crate::tlog!("[csv] Logging flight data to {}", path.display());

        Ok(CsvSink {
            writer,
            path: path.to_path_buf(),
            field_columns,
            rows_written: 0,
            failing: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn write_frame(&mut self, frame: &DecodedFrame) -> Result<(), IoError> {
        let host_time = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.3f")
            .to_string();
        let meta = &frame.metadata;

        for reading in &frame.readings {
            let mut record: Vec<String> = Vec::with_capacity(CSV_FIXED_COLUMNS.len() + self.field_columns.len());
            record.push(host_time.clone());
            record.push(meta.address.clone());
            record.push(meta.rssi.map(|v| v.to_string()).unwrap_or_default());
            record.push(meta.snr.map(|v| v.to_string()).unwrap_or_default());
            record.push(reading.sensor_id.to_string());
            record.push(reading.sensor_name.clone());
            record.push(reading.enum_label.clone().unwrap_or_default());
            for column in &self.field_columns {
                record.push(
                    reading
                        .fields
                        .get(*column)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            self.writer.write_record(&record)?;
            self.rows_written += 1;
        }

        self.writer.flush()?;
        Ok(())
    }
}

impl TelemetrySink for CsvSink {
    fn on_frame(&mut self, frame: &DecodedFrame) {
        match self.write_frame(frame) {
            Ok(()) => {
                if self.failing {
                    crate::tlog!("[csv] Writes to {} recovered", self.path.display());
                    self.failing = false;
                }
            }
            Err(e) => {
                if !self.failing {
                    crate::tlog!("[csv] Failed to write {}: {}", self.path.display(), e);
                    self.failing = true;
                }
            }
        }
    }

    fn on_rejected(&mut self, _error: &FrameError, _raw_line: &str) {}

    fn on_status(&mut self, state: &LinkState) {
        if *state == LinkState::Disconnected {
            if let Err(e) = self.writer.flush() {
                crate::tlog!("[csv] Flush failed on {}: {}", self.path.display(), e);
            }
        }
    }
}
