// src/link/mod.rs
//
// Link layer: connection lifecycle and event delivery.
//
// - state.rs   - pure link state machine (Disconnected/Connecting/Connected/Degraded)
// - session.rs - session thread: open, read, frame, decode, reconnect
// - sink.rs    - TelemetrySink trait and the session-to-sink channels
// - clock.rs   - time source (system or manual)

pub mod clock;
pub mod session;
pub mod sink;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use session::{LinkSession, SessionOptions};
pub use sink::{LinkEvent, LinkStats, TelemetrySink, REJECT_QUEUE_DEPTH};
pub use state::{LinkState, LinkStateMachine};
