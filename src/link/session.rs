// src/link/session.rs
//
// Link session: owns the serial connection to the modem.
//
// A named OS thread does blocking reads with a short timeout, frames bytes into
// lines, decodes each line and publishes the result. Open failures and dead ports
// are retried after a fixed backoff. A second thread delivers events to the sink
// (see sink.rs), so a slow sink never stalls the read loop.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};
use super::sink::{
    event_channel, run_dispatcher, EventPublisher, LinkCounters, LinkStats, TelemetrySink,
};
use super::state::{LinkState, LinkStateMachine};
use crate::io::serial::DEFAULT_MAX_LINE_LENGTH;
use crate::io::{IoError, LineFramer, LinkPort, PortProvider, PortTarget, SerialPortProvider};
use crate::telemetry::{FrameDecoder, DEFAULT_MARKER};

/// Bytes requested per read call
const READ_CHUNK: usize = 256;

// ============================================================================
// Options
// ============================================================================

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Port to open at start. None waits for `set_port`.
    pub target: Option<PortTarget>,
    pub marker: String,
    /// Time without a decoded frame before the link is reported Degraded
    pub silence_timeout: Duration,
    /// Wait between a failed open (or a dead port) and the next attempt
    pub reconnect_delay: Duration,
    pub max_line_length: usize,
    /// Idle sleep while no port is open
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            target: None,
            marker: DEFAULT_MARKER.to_string(),
            silence_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            poll_interval: Duration::from_millis(50),
        }
    }
}

enum Command {
    SetPort(PortTarget),
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to a running link session. Dropping it stops the session.
pub struct LinkSession {
    cancel_flag: Arc<AtomicBool>,
    command_tx: std_mpsc::Sender<Command>,
    counters: Arc<LinkCounters>,
    state: Arc<Mutex<LinkState>>,
    session_thread: Option<JoinHandle<()>>,
    dispatcher_thread: Option<JoinHandle<()>>,
}

impl LinkSession {
    /// Start a session on real serial ports with the system clock
    pub fn open_serial(
        options: SessionOptions,
        sink: Box<dyn TelemetrySink>,
    ) -> Result<Self, IoError> {
        Self::start(
            options,
            Box::new(SerialPortProvider),
            Arc::new(SystemClock),
            sink,
        )
    }

    pub fn start(
        options: SessionOptions,
        provider: Box<dyn PortProvider>,
        clock: Arc<dyn Clock>,
        sink: Box<dyn TelemetrySink>,
    ) -> Result<Self, IoError> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(LinkCounters::default());
        let state = Arc::new(Mutex::new(LinkState::Disconnected));
        let (command_tx, command_rx) = std_mpsc::channel();
        let (publisher, subscriber) = event_channel(counters.clone());

        let dispatcher_thread = thread::Builder::new()
            .name("link-dispatch".into())
            .spawn(move || {
                let mut sink = sink;
                run_dispatcher(subscriber, sink.as_mut());
            })?;

        let worker = SessionWorker {
            machine: LinkStateMachine::new(options.silence_timeout),
            decoder: FrameDecoder::new(options.marker.clone()),
            framer: LineFramer::new(options.max_line_length),
            target: options.target.clone(),
            options,
            provider,
            clock,
            publisher,
            shared_state: state.clone(),
            cancel_flag: cancel_flag.clone(),
            command_rx,
        };

        let session_thread = match thread::Builder::new()
            .name("link-session".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                // The worker (and its publisher) was dropped with the closure, which ends the dispatcher
                let _ = dispatcher_thread.join();
                return Err(e.into());
            }
        };

        Ok(LinkSession {
            cancel_flag,
            command_tx,
            counters,
            state,
            session_thread: Some(session_thread),
            dispatcher_thread: Some(dispatcher_thread),
        })
    }

    /// Switch to a different port. The current port (if any) is closed and the
    /// connect cycle restarts on the new target.
    pub fn set_port(&self, target: PortTarget) -> Result<(), IoError> {
        self.command_tx
            .send(Command::SetPort(target))
            .map_err(|_| IoError::SessionStopped)
    }

    pub fn state(&self) -> LinkState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.session_thread.is_some()
    }

    /// Stop the session. The port is closed and every pending event has reached
    /// the sink when this returns. Safe to call more than once.
    pub fn stop(&mut self) {
        self.cancel_flag.store(true, Ordering::Relaxed);

        if let Some(handle) = self.session_thread.take() {
            if handle.join().is_err() {
                crate::tlog!("[link] Session thread panicked");
            }
        }
        if let Some(handle) = self.dispatcher_thread.take() {
            if handle.join().is_err() {
                crate::tlog!("[link] Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Session thread
// ============================================================================

/// Open port; closing is dropping
struct PortGuard {
    port: Box<dyn LinkPort>,
    label: String,
}

impl PortGuard {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        crate::tlog!("[link:{}] Port closed", self.label);
    }
}

/// What a read told us about the port
enum ReadOutcome {
    Data(usize),
    Idle,
    Transient(String),
    Failed(String),
}

fn classify_read(result: std::io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Failed("end of stream".to_string()),
        Ok(n) => ReadOutcome::Data(n),
        Err(e) => match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ReadOutcome::Idle,
            ErrorKind::Interrupted | ErrorKind::InvalidData => ReadOutcome::Transient(e.to_string()),
            _ => ReadOutcome::Failed(e.to_string()),
        },
    }
}

struct SessionWorker {
    options: SessionOptions,
    target: Option<PortTarget>,
    machine: LinkStateMachine,
    decoder: FrameDecoder,
    framer: LineFramer,
    provider: Box<dyn PortProvider>,
    clock: Arc<dyn Clock>,
    publisher: EventPublisher,
    shared_state: Arc<Mutex<LinkState>>,
    cancel_flag: Arc<AtomicBool>,
    command_rx: std_mpsc::Receiver<Command>,
}

impl SessionWorker {
    fn label(&self) -> &str {
        self.target.as_ref().map(|t| t.port.as_str()).unwrap_or("-")
    }

    fn run(mut self) {
        let mut port: Option<PortGuard> = None;
        // When the next open may be attempted
        let mut next_attempt: Option<Instant> = None;
        let mut buf = [0u8; READ_CHUNK];

        if self.target.is_some() {
            let change = self.machine.configure();
            self.emit(change);
            next_attempt = Some(self.clock.now());
        }

        loop {
            if self.cancel_flag.load(Ordering::Relaxed) {
                break;
            }

            while let Ok(command) = self.command_rx.try_recv() {
                match command {
                    Command::SetPort(target) => {
                        crate::tlog!("[link] Switching to {}", target.describe());
                        port = None;
                        self.target = Some(target);
                        let change = self.machine.configure();
                        self.emit(change);
                        next_attempt = Some(self.clock.now());
                    }
                }
            }

            let Some(guard) = port.as_mut() else {
                if let Some(opened) = self.try_open(&mut next_attempt) {
                    port = Some(opened);
                }
                continue;
            };

            match classify_read(guard.read(&mut buf)) {
                ReadOutcome::Data(n) => {
                    for line in self.framer.feed(&buf[..n]) {
                        self.handle_line(&line.text);
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Transient(reason) => {
                    crate::tlog!("[link:{}] Read error: {}", self.label(), reason);
                    let change = self.machine.on_read_error(&reason);
                    self.emit(change);
                }
                ReadOutcome::Failed(reason) => {
                    crate::tlog!("[link:{}] Port failed: {}", self.label(), reason);
                    port = None;
                    if let Some(partial) = self.framer.flush() {
                        crate::tlog!("[link:{}] Dropped partial line '{}'", self.label(), partial.text);
                    }
                    let change = self.machine.on_port_failed();
                    self.emit(change);
                    next_attempt = Some(self.clock.now() + self.options.reconnect_delay);
                    continue;
                }
            }

            let change = self.machine.check_silence(self.clock.now());
            self.emit(change);
        }

        drop(port);
        let change = self.machine.stop();
        self.emit(change);
        let stats = self.publisher.counters().snapshot();
        let framing = self.framer.stats();
        crate::tlog!(
            "[link] Session stopped ({} lines, {} frames, {} rejected, {} bytes discarded)",
            framing.lines,
            stats.frames_decoded,
            stats.frames_rejected,
            framing.discarded_bytes
        );
    }

    /// Attempt an open once the backoff has elapsed. Sleeps at most one poll
    /// interval so cancellation and commands stay responsive.
    fn try_open(&mut self, next_attempt: &mut Option<Instant>) -> Option<PortGuard> {
        let (Some(target), Some(at)) = (self.target.clone(), *next_attempt) else {
            thread::sleep(self.options.poll_interval);
            return None;
        };

        let now = self.clock.now();
        if now < at {
            thread::sleep(self.options.poll_interval.min(at - now));
            return None;
        }

        match self.provider.open(&target) {
            Ok(handle) => {
                crate::tlog!("[link:{}] Opened {}", target.port, target.describe());
                *next_attempt = None;
                self.framer.reset();
                let change = self.machine.on_opened(self.clock.now());
                self.emit(change);
                Some(PortGuard {
                    port: handle,
                    label: target.port,
                })
            }
            Err(e) => {
                crate::tlog!(
                    "[link:{}] {} (retrying in {} ms)",
                    target.port,
                    e,
                    self.options.reconnect_delay.as_millis()
                );
                self.publisher.connect_failed(e.to_string());
                *next_attempt = Some(now + self.options.reconnect_delay);
                None
            }
        }
    }

    fn handle_line(&mut self, text: &str) {
        match self.decoder.decode_line(text) {
            Ok(frame) => {
                for advisory in &frame.advisories {
                    crate::tlog!("[link:{}] Advisory: {:?}", self.label(), advisory);
                }
                let change = self.machine.on_frame_decoded(self.clock.now());
                self.emit(change);
                self.publisher.frame(frame);
            }
            Err(error) => {
                if !error.is_noise() {
                    crate::tlog!("[link:{}] Rejected '{}': {}", self.label(), text, error);
                }
                self.publisher.rejected(error, text);
            }
        }
    }

    fn emit(&self, change: Option<LinkState>) {
        let Some(state) = change else {
            return;
        };
        crate::tlog!("[link:{}] {}", self.label(), state);
        match self.shared_state.lock() {
            Ok(mut shared) => *shared = state.clone(),
            Err(poisoned) => *poisoned.into_inner() = state.clone(),
        }
        self.publisher.status(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::clock::ManualClock;
    use crate::telemetry::{DecodedFrame, FrameError};
    use std::collections::VecDeque;
    use std::io::Write;

    // ------------------------------------------------------------------------
    // Scripted port and provider
    // ------------------------------------------------------------------------

    struct ScriptedPort {
        reads: VecDeque<std::io::Result<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedPort {
        fn new(reads: Vec<std::io::Result<Vec<u8>>>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                ScriptedPort {
                    reads: reads.into(),
                    closed: closed.clone(),
                },
                closed,
            )
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    thread::sleep(Duration::from_millis(2));
                    Err(std::io::Error::new(ErrorKind::TimedOut, "timed out"))
                }
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Drop for ScriptedPort {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        opens: VecDeque<Result<ScriptedPort, String>>,
        attempts: Arc<Mutex<Vec<String>>>,
    }

    impl PortProvider for ScriptedProvider {
        fn open(&mut self, target: &PortTarget) -> Result<Box<dyn LinkPort>, IoError> {
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push(target.port.clone());
            }
            match self.opens.pop_front() {
                Some(Ok(port)) => Ok(Box::new(port)),
                Some(Err(reason)) => Err(IoError::open(&target.port, reason)),
                None => Err(IoError::open(&target.port, "no such device")),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Recording sink
    // ------------------------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Recorded {
        Frame(DecodedFrame),
        Rejected(FrameError),
        Status(LinkState),
        ConnectFailed(String),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<Recorded>>>,
    }

    impl RecordingSink {
        fn push(&self, event: Recorded) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        fn statuses(&self) -> Vec<LinkState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Recorded::Status(s) => Some(s),
                    _ => None,
                })
                .collect()
        }

        fn frames(&self) -> Vec<DecodedFrame> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Recorded::Frame(f) => Some(f),
                    _ => None,
                })
                .collect()
        }

        fn wait_for(&self, what: &str, predicate: impl Fn(&[Recorded]) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(3);
            while Instant::now() < deadline {
                if predicate(&self.events()) {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            panic!("timed out waiting for {}: {:?}", what, self.events());
        }

        fn wait_for_status(&self, state: LinkState) {
            let wanted = state.clone();
            self.wait_for(&format!("{}", state), move |events| {
                events
                    .iter()
                    .any(|e| matches!(e, Recorded::Status(s) if *s == wanted))
            });
        }
    }

    impl TelemetrySink for RecordingSink {
        fn on_frame(&mut self, frame: &DecodedFrame) {
            self.push(Recorded::Frame(frame.clone()));
        }

        fn on_rejected(&mut self, error: &FrameError, _raw_line: &str) {
            self.push(Recorded::Rejected(error.clone()));
        }

        fn on_status(&mut self, state: &LinkState) {
            self.push(Recorded::Status(state.clone()));
        }

        fn on_connect_failed(&mut self, reason: &str) {
            self.push(Recorded::ConnectFailed(reason.to_string()));
        }
    }

    fn options(port: Option<&str>) -> SessionOptions {
        SessionOptions {
            target: port.map(|p| PortTarget::new(p, 115200)),
            poll_interval: Duration::from_millis(5),
            ..SessionOptions::default()
        }
    }

    fn start(
        options: SessionOptions,
        provider: ScriptedProvider,
        clock: Arc<ManualClock>,
    ) -> (LinkSession, RecordingSink) {
        let sink = RecordingSink::default();
        let session =
            LinkSession::start(options, Box::new(provider), clock, Box::new(sink.clone())).unwrap();
        (session, sink)
    }

    // Rocket_State BOOST: bytes [5, 2]
    const BOOST_LINE: &[u8] = b"+RCV=42,2,BQI=,-40,10\r\n";

    #[test]
    fn test_frame_decoded_after_connect() {
        let (port, closed) = ScriptedPort::new(vec![Ok(BOOST_LINE.to_vec())]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, Arc::new(ManualClock::new()));

        sink.wait_for("frame", |events| {
            events.iter().any(|e| matches!(e, Recorded::Frame(_)))
        });

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].metadata.address, "42");
        assert_eq!(frames[0].readings[0].enum_label.as_deref(), Some("BOOST"));
        assert_eq!(session.state(), LinkState::Connected);
        assert_eq!(session.stats().frames_decoded, 1);

        session.stop();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(
            sink.statuses(),
            vec![
                LinkState::Connecting,
                LinkState::Connected,
                LinkState::Disconnected
            ]
        );
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_lines_split_across_reads() {
        let (port, _closed) = ScriptedPort::new(vec![
            Ok(b"+RCV=42,2,".to_vec()),
            Ok(b"BQI=,-40,10\n".to_vec()),
        ]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, Arc::new(ManualClock::new()));

        sink.wait_for("frame", |events| {
            events.iter().any(|e| matches!(e, Recorded::Frame(_)))
        });
        session.stop();
        assert_eq!(session.stats().frames_rejected, 0);
    }

    #[test]
    fn test_rejected_line_keeps_link_connected() {
        let (port, _closed) = ScriptedPort::new(vec![
            Ok(b"+RCV=42,2,!!!!,-40,10\n".to_vec()),
            Ok(b"AT+OK\n".to_vec()),
            Ok(BOOST_LINE.to_vec()),
        ]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, Arc::new(ManualClock::new()));

        sink.wait_for("frame", |events| {
            events.iter().any(|e| matches!(e, Recorded::Frame(_)))
        });
        session.stop();

        let events = sink.events();
        let rejected: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Recorded::Rejected(err) => Some(err.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 2);
        assert!(matches!(rejected[0], FrameError::PayloadDecodeFailed(_)));
        assert_eq!(rejected[1], FrameError::NotATelemetryLine);
        assert!(!sink
            .statuses()
            .iter()
            .any(|s| matches!(s, LinkState::Degraded(_))));

        let stats = session.stats();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.frames_rejected, 2);
    }

    #[test]
    fn test_open_failure_retries_after_backoff() {
        let (port, _closed) = ScriptedPort::new(vec![]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Err("Device or resource busy".to_string()), Ok(port)]),
            ..Default::default()
        };
        let attempts = provider.attempts.clone();
        let clock = Arc::new(ManualClock::new());
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, clock.clone());

        sink.wait_for("connect failure", |events| {
            events.iter().any(|e| matches!(e, Recorded::ConnectFailed(_)))
        });

        // The backoff is measured on the session clock, which has not moved
        thread::sleep(Duration::from_millis(50));
        assert_eq!(attempts.lock().unwrap().len(), 1);
        assert_eq!(session.state(), LinkState::Connecting);

        clock.advance(Duration::from_secs(2));
        sink.wait_for_status(LinkState::Connected);
        assert_eq!(attempts.lock().unwrap().len(), 2);

        session.stop();
        assert_eq!(
            sink.statuses(),
            vec![
                LinkState::Connecting,
                LinkState::Connected,
                LinkState::Disconnected
            ]
        );
        match &sink.events()[1] {
            Recorded::ConnectFailed(reason) => assert!(reason.contains("busy")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_silence_degrades_without_dropping_port() {
        let (port, closed) = ScriptedPort::new(vec![]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let attempts = provider.attempts.clone();
        let clock = Arc::new(ManualClock::new());
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, clock.clone());

        sink.wait_for_status(LinkState::Connected);
        clock.advance(Duration::from_secs(6));
        sink.wait_for("degraded", |events| {
            events
                .iter()
                .any(|e| matches!(e, Recorded::Status(LinkState::Degraded(r)) if r.contains("no telemetry")))
        });

        assert!(!closed.load(Ordering::SeqCst));
        assert_eq!(attempts.lock().unwrap().len(), 1);

        session.stop();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_transient_read_error_degrades_until_next_frame() {
        let (port, closed) = ScriptedPort::new(vec![
            Err(std::io::Error::new(ErrorKind::Interrupted, "interrupted")),
            Ok(BOOST_LINE.to_vec()),
        ]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, Arc::new(ManualClock::new()));

        sink.wait_for("frame", |events| {
            events.iter().any(|e| matches!(e, Recorded::Frame(_)))
        });
        assert!(!closed.load(Ordering::SeqCst));
        session.stop();

        assert_eq!(
            sink.statuses(),
            vec![
                LinkState::Connecting,
                LinkState::Connected,
                LinkState::Degraded("read error: interrupted".into()),
                LinkState::Connected,
                LinkState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_port_failure_closes_and_reconnects() {
        let (first, first_closed) = ScriptedPort::new(vec![Err(std::io::Error::new(
            ErrorKind::BrokenPipe,
            "device unplugged",
        ))]);
        let (second, _second_closed) = ScriptedPort::new(vec![]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(first), Ok(second)]),
            ..Default::default()
        };
        let attempts = provider.attempts.clone();
        let clock = Arc::new(ManualClock::new());
        let (mut session, sink) = start(options(Some("/dev/ttyUSB0")), provider, clock.clone());

        sink.wait_for("reconnect", |events| {
            events
                .iter()
                .filter(|e| matches!(e, Recorded::Status(LinkState::Connecting)))
                .count()
                == 2
        });
        assert!(first_closed.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(attempts.lock().unwrap().len(), 1);

        clock.advance(Duration::from_secs(2));
        sink.wait_for("second connect", |events| {
            events
                .iter()
                .filter(|e| matches!(e, Recorded::Status(LinkState::Connected)))
                .count()
                == 2
        });
        assert_eq!(attempts.lock().unwrap().len(), 2);
        session.stop();
    }

    #[test]
    fn test_set_port_starts_connect_cycle() {
        let (port, _closed) = ScriptedPort::new(vec![Ok(BOOST_LINE.to_vec())]);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let attempts = provider.attempts.clone();
        let (mut session, sink) = start(options(None), provider, Arc::new(ManualClock::new()));

        thread::sleep(Duration::from_millis(30));
        assert!(sink.events().is_empty());
        assert_eq!(session.state(), LinkState::Disconnected);

        session
            .set_port(PortTarget::new("/dev/ttyACM1", 57600))
            .unwrap();
        sink.wait_for("frame", |events| {
            events.iter().any(|e| matches!(e, Recorded::Frame(_)))
        });
        assert_eq!(attempts.lock().unwrap().as_slice(), ["/dev/ttyACM1"]);

        session.stop();
        assert!(matches!(
            session.set_port(PortTarget::new("/dev/ttyACM1", 57600)),
            Err(IoError::SessionStopped)
        ));
    }

    /// Blocks in the first `on_frame` until released
    struct GatedSink {
        gate: Option<std_mpsc::Receiver<()>>,
        recorder: RecordingSink,
    }

    impl TelemetrySink for GatedSink {
        fn on_frame(&mut self, frame: &DecodedFrame) {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv_timeout(Duration::from_secs(3));
            }
            self.recorder.on_frame(frame);
        }

        fn on_rejected(&mut self, error: &FrameError, raw_line: &str) {
            self.recorder.on_rejected(error, raw_line);
        }

        fn on_status(&mut self, state: &LinkState) {
            self.recorder.on_status(state);
        }
    }

    #[test]
    fn test_slow_sink_does_not_stall_reads() {
        // Rocket_State IDLE, BOOST, BURNOUT, COAST, APOGEE
        let lines = ["BQE=", "BQI=", "BQM=", "BQQ=", "BQU="]
            .iter()
            .map(|b64| Ok(format!("+RCV=42,2,{},-40,10\r\n", b64).into_bytes()))
            .collect();
        let (port, closed) = ScriptedPort::new(lines);
        let provider = ScriptedProvider {
            opens: VecDeque::from([Ok(port)]),
            ..Default::default()
        };
        let (release, gate) = std_mpsc::channel();
        let recorder = RecordingSink::default();
        let sink = GatedSink {
            gate: Some(gate),
            recorder: recorder.clone(),
        };
        let mut session = LinkSession::start(
            options(Some("/dev/ttyUSB0")),
            Box::new(provider),
            Arc::new(ManualClock::new()),
            Box::new(sink),
        )
        .unwrap();

        // Every line is decoded while the sink is still stuck on its first frame
        let deadline = Instant::now() + Duration::from_secs(3);
        while session.stats().frames_decoded < 5 {
            assert!(Instant::now() < deadline, "read loop stalled: {:?}", session.stats());
            thread::sleep(Duration::from_millis(5));
        }
        assert!(recorder.frames().is_empty());
        assert_eq!(session.state(), LinkState::Connected);

        release.send(()).unwrap();
        recorder.wait_for("latest frame", |events| {
            events.iter().any(|e| {
                matches!(e, Recorded::Frame(f) if f.readings[0].enum_label.as_deref() == Some("APOGEE"))
            })
        });

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(closed.load(Ordering::SeqCst));

        let stats = session.stats();
        assert_eq!(stats.frames_decoded, 5);
        assert!(stats.frames_delivered < stats.frames_decoded);
        assert!(recorder.frames().len() <= 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let provider = ScriptedProvider::default();
        let (mut session, sink) = start(options(Some("/dev/missing")), provider, Arc::new(ManualClock::new()));

        sink.wait_for("connect failure", |events| {
            events.iter().any(|e| matches!(e, Recorded::ConnectFailed(_)))
        });
        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert_eq!(
            sink.statuses(),
            vec![LinkState::Connecting, LinkState::Disconnected]
        );
    }
}
