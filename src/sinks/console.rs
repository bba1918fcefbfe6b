// src/sinks/console.rs
//
// Prints decoded frames, rejections and link status to the log.

use crate::link::{LinkState, TelemetrySink};
use crate::telemetry::{DecodedFrame, FrameAdvisory, FrameError, SensorReading};

/// `IMU: tilt_angle=1.50 g_force_z=0.98 ...` or `Rocket_State: BOOST`
pub fn format_reading(reading: &SensorReading) -> String {
    if let Some(label) = &reading.enum_label {
        return format!("{}: {}", reading.sensor_name, label);
    }
    if reading.fields.is_empty() {
        return reading.sensor_name.clone();
    }
    let values: Vec<String> = reading
        .fields
        .iter()
        .map(|(name, value)| format!("{}={:.2}", name, value))
        .collect();
    format!("{}: {}", reading.sensor_name, values.join(" "))
}

/// One line summary of a frame's link metadata and advisories
pub fn format_frame(frame: &DecodedFrame) -> String {
    let meta = &frame.metadata;
    let rssi = meta.rssi.map_or_else(|| "?".to_string(), |v| v.to_string());
    let snr = meta.snr.map_or_else(|| "?".to_string(), |v| format!("{:.1}", v));
    let mut line = format!(
        "from {} RSSI={} SNR={} ({} bytes, {} readings)",
        meta.address,
        rssi,
        snr,
        meta.actual_length,
        frame.readings.len()
    );
    for advisory in &frame.advisories {
        match advisory {
            FrameAdvisory::LengthMismatch { reported, actual } => {
                line.push_str(&format!(" [length {} != reported {}]", actual, reported));
            }
            FrameAdvisory::UnparsableLength { raw } => {
                line.push_str(&format!(" [unparsable length '{}']", raw));
            }
            FrameAdvisory::UnparsableMetadata { field, raw } => {
                line.push_str(&format!(" [unparsable {} '{}']", field, raw));
            }
        }
    }
    line
}

/// Logs everything the link reports. Noise lines are skipped unless `show_noise`.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    show_noise: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_noise(mut self, show_noise: bool) -> Self {
        self.show_noise = show_noise;
        self
    }
}

impl TelemetrySink for ConsoleSink {
    fn on_frame(&mut self, frame: &DecodedFrame) {
        crate::tlog!("[rx] {}", format_frame(frame));
        for reading in &frame.readings {
            crate::tlog!("[rx]   {}", format_reading(reading));
        }
    }

    fn on_rejected(&mut self, error: &FrameError, raw_line: &str) {
        if error.is_noise() && !self.show_noise {
            return;
        }
        crate::tlog!("[rx] dropped: {} | {}", error, raw_line);
    }

    fn on_status(&mut self, state: &LinkState) {
        crate::tlog!("[link] {}", state);
    }

    fn on_connect_failed(&mut self, reason: &str) {
        crate::tlog!("[link] connect failed: {}", reason);
    }
}
