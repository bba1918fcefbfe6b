// src/io/serial/framer.rs
//
// Line framing for the modem's ASCII output.
//
// The modem terminates every report with CRLF, but a radio link drops bytes and the
// serial port can hand us garbage on connect. The framer splits on LF, strips the CR,
// skips empty lines, and throws away anything that grows past `max_length` without a
// terminator rather than letting one missing newline swallow the next report.

// =============================================================================
// Constants
// =============================================================================

const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// Default cap on a single line. A full +RCV report carries at most a 240-byte
/// LoRa payload, which is 320 characters of base64.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 512;

// =============================================================================
// Types
// =============================================================================

/// A complete line extracted from the serial stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLine {
    /// Line text with the terminator removed. Invalid UTF-8 is replaced, not rejected.
    pub text: String,
    /// Whether this line came from flush() and had no terminator
    pub incomplete: bool,
}

/// Running totals, mostly for log output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub lines: u64,
    /// Bytes dropped because a line exceeded the length cap
    pub discarded_bytes: u64,
}

// =============================================================================
// Line Framer
// =============================================================================

/// Stateful LF-delimited framer for streaming data
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
    /// Set after an overflow; bytes are dropped until the next LF
    discarding: bool,
    stats: FramerStats,
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::with_capacity(max_length.min(1024)),
            max_length: max_length.max(1),
            discarding: false,
            stats: FramerStats::default(),
        }
    }

    /// Feed raw bytes into the framer.
    /// Returns any complete lines that were parsed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<SerialLine> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == LF {
                if self.discarding {
                    self.discarding = false;
                    self.stats.discarded_bytes += 1;
                    continue;
                }
                if let Some(line) = self.take_line(false) {
                    lines.push(line);
                }
                continue;
            }

            if self.discarding {
                self.stats.discarded_bytes += 1;
                continue;
            }

            self.buffer.push(byte);

            // Force a resync on overlong lines. A trailing CR is stripped later, so it
            // does not count against the cap.
            let limit = if byte == CR { self.max_length.saturating_add(1) } else { self.max_length };
            if self.buffer.len() > limit {
                self.stats.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Flush any remaining buffered data as a line.
    /// Call when the stream ends; the line is marked incomplete since no LF was seen.
    pub fn flush(&mut self) -> Option<SerialLine> {
        self.discarding = false;
        self.take_line(true)
    }

    /// Drop buffered bytes, e.g. after the port was reopened
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    fn take_line(&mut self, incomplete: bool) -> Option<SerialLine> {
        if self.buffer.last() == Some(&CR) {
            self.buffer.pop();
        }
        if self.buffer.is_empty() {
            return None;
        }

        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.stats.lines += 1;
        Some(SerialLine { text, incomplete })
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new(DEFAULT_MAX_LINE_LENGTH)
    }
}
