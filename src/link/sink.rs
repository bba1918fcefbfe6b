// src/link/sink.rs
//
// Event delivery from the session thread to consumers.
//
// The session thread never calls a sink directly. It publishes into three channels
// and a dispatcher thread drains them into the sink:
//   - decoded frames: watch slot of depth 1, the newest frame overwrites an undelivered one
//   - rejections:     bounded queue, dropped (and counted) when the sink falls behind
//   - status:         unbounded queue, every transition is delivered in order
// A slow sink therefore costs stale frames, never a stalled read loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::state::LinkState;
use crate::telemetry::{DecodedFrame, FrameError};

/// Rejections buffered for a slow sink before new ones are dropped
pub const REJECT_QUEUE_DEPTH: usize = 32;

// ============================================================================
// Sink interface
// ============================================================================

/// Consumer of link events. Called from the dispatcher thread only.
pub trait TelemetrySink: Send {
    /// A line decoded into a frame
    fn on_frame(&mut self, frame: &DecodedFrame);

    /// A line failed to decode
    fn on_rejected(&mut self, error: &FrameError, raw_line: &str);

    /// The link changed state
    fn on_status(&mut self, state: &LinkState);

    /// A connection attempt failed; the session retries after its backoff
    fn on_connect_failed(&mut self, _reason: &str) {}
}

/// Fan-out: every sink sees every event, in registration order
impl TelemetrySink for Vec<Box<dyn TelemetrySink>> {
    fn on_frame(&mut self, frame: &DecodedFrame) {
        for sink in self.iter_mut() {
            sink.on_frame(frame);
        }
    }

    fn on_rejected(&mut self, error: &FrameError, raw_line: &str) {
        for sink in self.iter_mut() {
            sink.on_rejected(error, raw_line);
        }
    }

    fn on_status(&mut self, state: &LinkState) {
        for sink in self.iter_mut() {
            sink.on_status(state);
        }
    }

    fn on_connect_failed(&mut self, reason: &str) {
        for sink in self.iter_mut() {
            sink.on_connect_failed(reason);
        }
    }
}

/// Events that travel through the ordered queues
#[derive(Debug, Clone)]
pub enum LinkEvent {
    FrameRejected { error: FrameError, raw_line: String },
    LinkStatusChanged(LinkState),
    ConnectFailed(String),
}

fn deliver(sink: &mut dyn TelemetrySink, event: LinkEvent) {
    match event {
        LinkEvent::FrameRejected { error, raw_line } => sink.on_rejected(&error, &raw_line),
        LinkEvent::LinkStatusChanged(state) => sink.on_status(&state),
        LinkEvent::ConnectFailed(reason) => sink.on_connect_failed(&reason),
    }
}

// ============================================================================
// Publisher (session side)
// ============================================================================

/// Counters shared between the session and its handle
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub frames_decoded: AtomicU64,
    pub frames_rejected: AtomicU64,
    /// Rejections that never reached the sink because its queue was full
    pub rejections_dropped: AtomicU64,
    /// Frames handed to the sink. Falls behind `frames_decoded` when the sink is
    /// slow and newer frames overwrite undelivered ones.
    pub frames_delivered: AtomicU64,
    /// Host time of the last decoded frame, microseconds since UNIX epoch
    pub last_frame_us: AtomicU64,
}

/// Snapshot of [`LinkCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LinkStats {
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub rejections_dropped: u64,
    pub frames_delivered: u64,
    pub last_frame_us: Option<u64>,
}

impl LinkCounters {
    pub fn snapshot(&self) -> LinkStats {
        let last = self.last_frame_us.load(Ordering::Relaxed);
        LinkStats {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            rejections_dropped: self.rejections_dropped.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            last_frame_us: (last != 0).then_some(last),
        }
    }
}

/// Sending half, owned by the session thread. Dropping it ends the dispatcher.
pub struct EventPublisher {
    frame_tx: watch::Sender<Option<Arc<DecodedFrame>>>,
    reject_tx: mpsc::Sender<LinkEvent>,
    status_tx: mpsc::UnboundedSender<LinkEvent>,
    counters: Arc<LinkCounters>,
}

/// Receiving half, owned by the dispatcher thread
pub struct EventSubscriber {
    frame_rx: watch::Receiver<Option<Arc<DecodedFrame>>>,
    reject_rx: mpsc::Receiver<LinkEvent>,
    status_rx: mpsc::UnboundedReceiver<LinkEvent>,
    counters: Arc<LinkCounters>,
}

/// Create a connected publisher/subscriber pair
pub fn event_channel(counters: Arc<LinkCounters>) -> (EventPublisher, EventSubscriber) {
    let (frame_tx, frame_rx) = watch::channel(None);
    let (reject_tx, reject_rx) = mpsc::channel(REJECT_QUEUE_DEPTH);
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    (
        EventPublisher {
            frame_tx,
            reject_tx,
            status_tx,
            counters: counters.clone(),
        },
        EventSubscriber {
            frame_rx,
            reject_rx,
            status_rx,
            counters,
        },
    )
}

impl EventPublisher {
    /// Publish a decoded frame. Never blocks; replaces an undelivered frame.
    pub fn frame(&self, frame: DecodedFrame) {
        self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_frame_us
            .store(crate::io::now_us(), Ordering::Relaxed);

        self.frame_tx.send_replace(Some(Arc::new(frame)));
    }

    /// Publish a rejected line. Never blocks; dropped when the sink is behind.
    pub fn rejected(&self, error: FrameError, raw_line: &str) {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
        let event = LinkEvent::FrameRejected {
            error,
            raw_line: raw_line.to_string(),
        };
        if self.reject_tx.try_send(event).is_err() {
            self.counters.rejections_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    pub fn status(&self, state: LinkState) {
        let _ = self.status_tx.send(LinkEvent::LinkStatusChanged(state));
    }

    pub fn connect_failed(&self, reason: String) {
        let _ = self.status_tx.send(LinkEvent::ConnectFailed(reason));
    }
}

// ============================================================================
// Dispatcher (sink side)
// ============================================================================

/// Drain events into the sink until the publisher is dropped, then deliver
/// whatever is still queued. Blocks the calling thread.
pub fn run_dispatcher(subscriber: EventSubscriber, sink: &mut dyn TelemetrySink) {
    let EventSubscriber {
        mut frame_rx,
        mut reject_rx,
        mut status_rx,
        counters,
    } = subscriber;

    futures::executor::block_on(async {
        loop {
            tokio::select! {
                biased;
                Some(event) = status_rx.recv() => deliver(sink, event),
                Some(event) = reject_rx.recv() => deliver(sink, event),
                changed = frame_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = frame_rx.borrow_and_update().clone();
                    if let Some(frame) = latest {
                        counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        sink.on_frame(&frame);
                    }
                }
            }
        }
    });

    while let Ok(event) = status_rx.try_recv() {
        deliver(sink, event);
    }
    while let Ok(event) = reject_rx.try_recv() {
        deliver(sink, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FrameDecoder;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct LogSink {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LogSink {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl TelemetrySink for LogSink {
        fn on_frame(&mut self, frame: &DecodedFrame) {
            self.log
                .lock()
                .unwrap()
                .push(format!("frame {}", frame.metadata.address));
        }

        fn on_rejected(&mut self, error: &FrameError, _raw_line: &str) {
            self.log.lock().unwrap().push(format!("rejected {}", error));
        }

        fn on_status(&mut self, state: &LinkState) {
            self.log.lock().unwrap().push(format!("status {}", state));
        }

        fn on_connect_failed(&mut self, reason: &str) {
            self.log.lock().unwrap().push(format!("failed {}", reason));
        }
    }

    fn frame(address: &str) -> DecodedFrame {
        FrameDecoder::default()
            .decode_line(&format!("+RCV={},2,BQI=,-40,10", address))
            .unwrap()
    }

    #[test]
    fn test_dispatcher_drains_after_publisher_drops() {
        let counters = Arc::new(LinkCounters::default());
        let (publisher, subscriber) = event_channel(counters.clone());

        publisher.status(LinkState::Connecting);
        publisher.connect_failed("busy".into());
        publisher.status(LinkState::Connected);
        publisher.rejected(FrameError::UnknownSensorId(9), "+RCV=1,1,CQ==,-40,10");
        publisher.frame(frame("7"));
        drop(publisher);

        let mut sink = LogSink::default();
        run_dispatcher(subscriber, &mut sink);

        assert_eq!(
            sink.entries(),
            vec![
                "status CONNECTING",
                "failed busy",
                "status CONNECTED",
                "rejected unknown sensor id 9",
                "frame 7",
            ]
        );
        let stats = counters.snapshot();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.frames_delivered, 1);
        assert!(stats.last_frame_us.is_some());
    }

    #[test]
    fn test_latest_frame_wins() {
        let counters = Arc::new(LinkCounters::default());
        let (publisher, subscriber) = event_channel(counters.clone());

        publisher.frame(frame("1"));
        publisher.frame(frame("2"));
        publisher.frame(frame("3"));
        drop(publisher);

        let mut sink = LogSink::default();
        run_dispatcher(subscriber, &mut sink);

        assert_eq!(sink.entries(), vec!["frame 3"]);
        let stats = counters.snapshot();
        assert_eq!(stats.frames_decoded, 3);
        assert_eq!(stats.frames_delivered, 1);
    }

    #[test]
    fn test_rejections_dropped_when_queue_full() {
        let counters = Arc::new(LinkCounters::default());
        let (publisher, subscriber) = event_channel(counters.clone());

        for _ in 0..REJECT_QUEUE_DEPTH + 8 {
            publisher.rejected(FrameError::NotATelemetryLine, "AT+OK");
        }
        // Status changes are never dropped
        publisher.status(LinkState::Disconnected);
        drop(publisher);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_rejected, REJECT_QUEUE_DEPTH as u64 + 8);
        assert_eq!(stats.rejections_dropped, 8);

        let mut sink = LogSink::default();
        run_dispatcher(subscriber, &mut sink);
        let entries = sink.entries();
        assert_eq!(entries.len(), REJECT_QUEUE_DEPTH + 1);
        assert_eq!(entries[0], "status DISCONNECTED");
    }

    #[test]
    fn test_dispatcher_on_its_own_thread() {
        let counters = Arc::new(LinkCounters::default());
        let (publisher, subscriber) = event_channel(counters);
        let sink = LogSink::default();

        let mut thread_sink = sink.clone();
        let handle = std::thread::spawn(move || run_dispatcher(subscriber, &mut thread_sink));

        publisher.status(LinkState::Connecting);
        publisher.status(LinkState::Connected);
        drop(publisher);
        handle.join().unwrap();

        assert_eq!(sink.entries(), vec!["status CONNECTING", "status CONNECTED"]);
    }

    #[test]
    fn test_vec_sink_fans_out() {
        let first = LogSink::default();
        let second = LogSink::default();
        let mut sinks: Vec<Box<dyn TelemetrySink>> =
            vec![Box::new(first.clone()), Box::new(second.clone())];

        sinks.on_status(&LinkState::Connected);
        sinks.on_frame(&frame("5"));
        sinks.on_connect_failed("gone");

        let expected = vec!["status CONNECTED", "frame 5", "failed gone"];
        assert_eq!(first.entries(), expected);
        assert_eq!(second.entries(), expected);
    }
}
