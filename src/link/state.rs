// src/link/state.rs
//
// Link state machine.
//
//   Disconnected -> Connecting -> Connected <-> Degraded
//        ^              ^  |          |            |
//        |              +--+ (retry)  +------------+--> Connecting (port failed)
//        +---------------- any state on stop ------------------+
//
// Pure transition logic. The session thread feeds it events and timestamps and
// forwards every returned state to the sinks.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Current state of the radio link
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Port still open but telemetry stopped or reads are failing
    Degraded(String),
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "DISCONNECTED"),
            LinkState::Connecting => write!(f, "CONNECTING"),
            LinkState::Connected => write!(f, "CONNECTED"),
            LinkState::Degraded(reason) => write!(f, "DEGRADED ({})", reason),
        }
    }
}

/// Transition table for a single link. Each event returns `Some(new_state)` when
/// the state actually changed and `None` otherwise.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: LinkState,
    silence_timeout: Duration,
    /// Last time the link proved it was carrying telemetry
    last_frame_at: Option<Instant>,
}

impl LinkStateMachine {
    pub fn new(silence_timeout: Duration) -> Self {
        LinkStateMachine {
            state: LinkState::Disconnected,
            silence_timeout,
            last_frame_at: None,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    /// A port was configured (initially or replaced). Any state restarts the connect cycle.
    pub fn configure(&mut self) -> Option<LinkState> {
        self.last_frame_at = None;
        self.transition(LinkState::Connecting)
    }

    /// The port opened. The silence clock starts now.
    pub fn on_opened(&mut self, now: Instant) -> Option<LinkState> {
        if self.state != LinkState::Connecting {
            return None;
        }
        self.last_frame_at = Some(now);
        self.transition(LinkState::Connected)
    }

    /// A line decoded into a frame
    pub fn on_frame_decoded(&mut self, now: Instant) -> Option<LinkState> {
        match self.state {
            LinkState::Connected => {
                self.last_frame_at = Some(now);
                None
            }
            LinkState::Degraded(_) => {
                self.last_frame_at = Some(now);
                self.transition(LinkState::Connected)
            }
            _ => None,
        }
    }

    /// A read failed but the port itself is still usable
    pub fn on_read_error(&mut self, reason: &str) -> Option<LinkState> {
        match self.state {
            LinkState::Connected => {
                self.transition(LinkState::Degraded(format!("read error: {}", reason)))
            }
            _ => None,
        }
    }

    /// Check for loss of signal. Only a Connected link can go silent; a Degraded
    /// link stays degraded until a frame arrives.
    pub fn check_silence(&mut self, now: Instant) -> Option<LinkState> {
        if self.state != LinkState::Connected {
            return None;
        }
        let last = self.last_frame_at?;
        let silent_for = now.saturating_duration_since(last);
        if silent_for > self.silence_timeout {
            self.transition(LinkState::Degraded(format!(
                "no telemetry for {}s",
                silent_for.as_secs()
            )))
        } else {
            None
        }
    }

    /// The port failed and was closed. Reconnect.
    pub fn on_port_failed(&mut self) -> Option<LinkState> {
        match self.state {
            LinkState::Connected | LinkState::Degraded(_) => {
                self.last_frame_at = None;
                self.transition(LinkState::Connecting)
            }
            _ => None,
        }
    }

    /// Explicit stop
    pub fn stop(&mut self) -> Option<LinkState> {
        self.last_frame_at = None;
        self.transition(LinkState::Disconnected)
    }

    fn transition(&mut self, next: LinkState) -> Option<LinkState> {
        if self.state == next {
            return None;
        }
        self.state = next.clone();
        Some(next)
    }
}
