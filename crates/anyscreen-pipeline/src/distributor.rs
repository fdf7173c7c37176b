//! `Distributor`: the broadcast hub between the scheduler and the sinks.
//!
//! ```text
//!  scheduler tick ──► broadcast(frame)
//!                        │
//!                    FrameGate ── too early ──► skipped (never encoded)
//!                        │
//!              registry.snapshot()  (registration order)
//!                        │
//!        ┌───────────────┼────────────────┐
//!     sink #1         sink #2  ✗        sink #3
//!        │       Disconnected → evict     │
//!        │       + close                  │
//!        └───────────────┴────────────────┘
//!                        │
//!                 BroadcastReport ──► Fatal? owning session stops
//! ```
//!
//! Delivery is sequential on the calling task, so backpressure is exerted at
//! the scheduler's tick rate and nothing is queued. One sink's error, or
//! panic, never reaches the others or the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyscreen_core::{Frame, RecordingError};
use tracing::{debug, error, trace, warn, Span};

use crate::registry::ClientRegistry;
use crate::sink::DeliveryError;

// ── FrameGate ─────────────────────────────────────────────────────────────────

/// Minimum inter-frame interval, evaluated on wall-clock time.
///
/// Admission deadlines sit on a grid of `interval` steps, with a tolerance of
/// a tenth of the interval, so a jittery producer running at a multiple of
/// the target rate still lands on the target rate. When the producer falls
/// more than one interval behind, the grid restarts from the current frame.
#[derive(Debug, Clone)]
pub struct FrameGate {
    interval:  Duration,
    tolerance: Duration,
    next_due:  Option<Instant>,
}

impl FrameGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval, tolerance: interval / 10, next_due: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a frame arriving at `now` should be delivered.
    pub fn admit(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due else {
            self.next_due = Some(now + self.interval);
            return true;
        };
        if now + self.tolerance < due {
            return false;
        }
        let next = due + self.interval;
        self.next_due = Some(if now >= next { now + self.interval } else { next });
        true
    }
}

// ── Reports and counters ──────────────────────────────────────────────────────

/// Outcome of one [`Distributor::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// The rate gate dropped this frame before any sink saw it.
    pub skipped:   bool,
    /// Sinks that wrote the frame downstream.
    pub delivered: usize,
    /// Sinks that returned without writing anything (idle recorder, frame
    /// that could not be encoded).
    pub passed:    usize,
    pub bytes:     u64,
    /// Sinks removed during this broadcast.
    pub evicted:   Vec<String>,
    /// First fatal error raised by a sink.
    pub fatal:     Option<RecordingError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorCounters {
    /// Frames delivered to at least one sink.
    pub frames_sent:    u64,
    /// Payload bytes written by all sinks.
    pub bytes_sent:     u64,
    /// Frames dropped by the rate gate.
    pub frames_skipped: u64,
    pub evictions:      u64,
}

#[derive(Default)]
struct Counters {
    frames_sent:    AtomicU64,
    bytes_sent:     AtomicU64,
    frames_skipped: AtomicU64,
    evictions:      AtomicU64,
}

// ── Distributor ───────────────────────────────────────────────────────────────

pub struct Distributor {
    registry: Arc<ClientRegistry>,
    gate:     Option<Mutex<FrameGate>>,
    counters: Counters,
    span:     Span,
}

impl Distributor {
    /// A distributor forwarding every frame it is given.
    pub fn new(registry: Arc<ClientRegistry>, span: Span) -> Self {
        Self { registry, gate: None, counters: Counters::default(), span }
    }

    /// A distributor that drops frames arriving sooner than `min_interval`
    /// after the previous admitted one.
    pub fn rate_limited(registry: Arc<ClientRegistry>, min_interval: Duration, span: Span) -> Self {
        Self { gate: Some(Mutex::new(FrameGate::new(min_interval))), ..Self::new(registry, span) }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> DistributorCounters {
        DistributorCounters {
            frames_sent:    self.counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent:     self.counters.bytes_sent.load(Ordering::Relaxed),
            frames_skipped: self.counters.frames_skipped.load(Ordering::Relaxed),
            evictions:      self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Hand `frame` to every registered sink, in registration order.
    pub async fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        if let Some(gate) = &self.gate {
            let admitted = gate.lock().unwrap_or_else(PoisonError::into_inner).admit(Instant::now());
            if !admitted {
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                trace!(parent: &self.span, "frame {} skipped by rate gate", frame.id());
                report.skipped = true;
                return report;
            }
        }

        for reg in self.registry.snapshot() {
            let Some(outcome) = reg.deliver(frame).await else {
                continue;
            };
            match outcome {
                Ok(0) => report.passed += 1,
                Ok(bytes) => {
                    report.delivered += 1;
                    report.bytes += bytes as u64;
                }
                Err(DeliveryError::Disconnected { reason }) => {
                    if self.registry.evict(&reg).await {
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        warn!(parent: &self.span, "client {} dropped: {}", reg.id(), reason);
                        reg.sink().close().await;
                        report.evicted.push(reg.id().to_owned());
                    }
                }
                Err(DeliveryError::Fatal(e)) => {
                    error!(parent: &self.span, "sink {} failed fatally: {}", reg.id(), e);
                    report.fatal.get_or_insert(e);
                }
            }
        }

        if report.delivered > 0 {
            self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.bytes_sent.fetch_add(report.bytes, Ordering::Relaxed);
        if !report.evicted.is_empty() {
            debug!(parent: &self.span, "{} client(s) remain", self.registry.len());
        }
        report
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicU32};

    use anyscreen_capture::{FrameSource, TestPatternSource};
    use anyscreen_core::EncoderError;
    use async_trait::async_trait;

    use crate::sink::Sink;

    #[derive(Clone, Copy)]
    enum Mode {
        Ok,
        Nothing,
        Disconnect,
        Fatal,
        Panic,
    }

    struct Scripted {
        id:        String,
        mode:      Mode,
        delivered: AtomicU32,
        closed:    AtomicBool,
    }

    impl Scripted {
        fn new(id: &str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                mode,
                delivered: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Sink for Scripted {
        fn id(&self) -> &str {
            &self.id
        }
        async fn deliver(&self, frame: &Frame) -> Result<usize, DeliveryError> {
            match self.mode {
                Mode::Ok => {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(frame.data().len())
                }
                Mode::Nothing => Ok(0),
                Mode::Disconnect => Err(DeliveryError::disconnected("broken pipe")),
                Mode::Fatal => Err(DeliveryError::Fatal(RecordingError::Encoder(
                    EncoderError::EncodingFailed { reason: "disk full".into() },
                ))),
                Mode::Panic => panic!("sink blew up"),
            }
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn frame() -> Frame {
        TestPatternSource::single(4, 2).capture(0).unwrap()
    }

    fn hub(sinks: &[Arc<Scripted>]) -> Distributor {
        let registry = Arc::new(ClientRegistry::unbounded(Span::none()));
        for s in sinks {
            registry.register(s.clone()).unwrap();
        }
        Distributor::new(registry, Span::none())
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_the_others() {
        for bad in [Mode::Disconnect, Mode::Fatal, Mode::Panic] {
            let sinks = [
                Scripted::new("one", Mode::Ok),
                Scripted::new("two", bad),
                Scripted::new("three", Mode::Ok),
            ];
            let hub = hub(&sinks);
            let report = hub.broadcast(&frame()).await;
            assert_eq!(report.delivered, 2);
            assert_eq!(sinks[0].delivered.load(Ordering::SeqCst), 1);
            assert_eq!(sinks[2].delivered.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn disconnected_sink_is_evicted_and_closed() {
        let sinks = [Scripted::new("ok", Mode::Ok), Scripted::new("gone", Mode::Disconnect)];
        let hub = hub(&sinks);

        let first = hub.broadcast(&frame()).await;
        assert_eq!(first.evicted, ["gone"]);
        assert!(sinks[1].closed.load(Ordering::SeqCst));
        assert!(!hub.registry().contains("gone"));

        let second = hub.broadcast(&frame()).await;
        assert!(second.evicted.is_empty());
        assert_eq!(sinks[0].delivered.load(Ordering::SeqCst), 2);
        assert_eq!(hub.counters().evictions, 1);
    }

    #[tokio::test]
    async fn panicking_sink_is_evicted() {
        let sinks = [Scripted::new("boom", Mode::Panic)];
        let hub = hub(&sinks);
        let report = hub.broadcast(&frame()).await;
        assert_eq!(report.evicted, ["boom"]);
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn fatal_error_is_reported_not_evicted() {
        let sinks = [Scripted::new("rec", Mode::Fatal)];
        let hub = hub(&sinks);
        let report = hub.broadcast(&frame()).await;
        assert!(matches!(report.fatal, Some(RecordingError::Encoder(_))));
        assert!(hub.registry().contains("rec"));
        assert_eq!(hub.counters().frames_sent, 0);
    }

    #[tokio::test]
    async fn counters_track_frames_and_bytes() {
        let sinks = [Scripted::new("a", Mode::Ok), Scripted::new("b", Mode::Ok)];
        let hub = hub(&sinks);
        let f = frame();
        hub.broadcast(&f).await;
        hub.broadcast(&f).await;
        let c = hub.counters();
        assert_eq!(c.frames_sent, 2);
        assert_eq!(c.bytes_sent, 4 * f.data().len() as u64);
    }

    #[tokio::test]
    async fn sinks_writing_nothing_do_not_count_as_sent() {
        let idle = hub(&[Scripted::new("idle", Mode::Nothing)]);
        let report = idle.broadcast(&frame()).await;
        assert_eq!((report.delivered, report.passed), (0, 1));
        assert_eq!(report.bytes, 0);
        assert_eq!(idle.counters().frames_sent, 0);
        assert!(idle.registry().contains("idle"));

        let mixed = hub(&[Scripted::new("idle", Mode::Nothing), Scripted::new("ok", Mode::Ok)]);
        let report = mixed.broadcast(&frame()).await;
        assert_eq!((report.delivered, report.passed), (1, 1));
        assert_eq!(mixed.counters().frames_sent, 1);
    }

    #[tokio::test]
    async fn empty_registry_sends_nothing() {
        let hub = hub(&[]);
        let report = hub.broadcast(&frame()).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(hub.counters().frames_sent, 0);
    }

    #[test]
    fn gate_halves_a_double_rate_producer() {
        let mut gate = FrameGate::new(Duration::from_nanos(1_000_000_000 / 30));
        let start = Instant::now();
        let tick = Duration::from_nanos(1_000_000_000 / 60);
        let admitted = (0..60u32).filter(|&i| gate.admit(start + tick * i)).count();
        assert_eq!(admitted, 30);
    }

    #[test]
    fn gate_tolerates_jitter() {
        let mut gate = FrameGate::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(gate.admit(t0));
        assert!(!gate.admit(t0 + Duration::from_millis(50)));
        // A few ms early still counts.
        assert!(gate.admit(t0 + Duration::from_millis(95)));
        assert!(!gate.admit(t0 + Duration::from_millis(150)));
        assert!(gate.admit(t0 + Duration::from_millis(201)));
    }

    #[test]
    fn gate_restarts_after_a_pause() {
        let mut gate = FrameGate::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(gate.admit(t0));
        assert!(gate.admit(t0 + Duration::from_secs(5)));
        // No burst to catch up with the missed slots.
        assert!(!gate.admit(t0 + Duration::from_millis(5010)));
        assert!(gate.admit(t0 + Duration::from_millis(5100)));
    }

    #[tokio::test]
    async fn rate_limited_distributor_counts_skips() {
        let registry = Arc::new(ClientRegistry::unbounded(Span::none()));
        let sink = Scripted::new("a", Mode::Ok);
        registry.register(sink.clone()).unwrap();
        let hub = Distributor::rate_limited(registry, Duration::from_secs(10), Span::none());

        let f = frame();
        assert!(!hub.broadcast(&f).await.skipped);
        assert!(hub.broadcast(&f).await.skipped);
        assert_eq!(hub.counters().frames_skipped, 1);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }
}
