//! `CaptureScheduler`: drives a [`FrameSource`] at a fixed rate.
//!
//! ```text
//!   Idle ──start()──► Running ──stop()──► Stopping ──(in-flight tick done)──► Idle
//! ```
//!
//! Tick `n` is due at `start + n × period`. Deadlines are computed from the
//! session start, never from the previous tick's completion, so a slow tick
//! delays the next one but does not shift the whole grid: the loop catches up
//! by running overdue ticks back to back. After a stall longer than one
//! second of ticks the grid is re-based at the current tick instead of
//! bursting through every missed deadline.
//!
//! At most one `FrameSource::capture` call is in flight per scheduler. A
//! capture that outlives `capture_timeout` keeps its slot; ticks that come
//! due before it returns are skipped rather than stacking another read on
//! the blocking pool.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyscreen_capture::FrameSource;
use anyscreen_core::{CaptureError, Frame, SchedulerError, MAX_FRAME_RATE};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Span};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// Counters for one Running period, returned by [`CaptureScheduler::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Ticks that started (capture attempted).
    pub ticks: u64,
    /// Frames handed to the callback.
    pub frames: u64,
    /// Ticks skipped because capture failed or timed out.
    pub failed_captures: u64,
    /// Times the deadline grid was re-based after a long stall.
    pub resyncs: u64,
}

type CaptureTask = JoinHandle<Result<Frame, CaptureError>>;

struct Inner {
    state:  SchedulerState,
    cancel: Option<CancellationToken>,
    task:   Option<JoinHandle<SchedulerReport>>,
}

// ── CaptureScheduler ──────────────────────────────────────────────────────────

pub struct CaptureScheduler {
    source:          Arc<dyn FrameSource>,
    capture_timeout: Duration,
    span:            Span,
    inner:           Mutex<Inner>,
    /// Capture abandoned by a timed-out tick, still running.
    in_flight:       Arc<Mutex<Option<CaptureTask>>>,
    stop_lock:       tokio::sync::Mutex<()>,
}

impl CaptureScheduler {
    pub fn new(source: Arc<dyn FrameSource>, capture_timeout: Duration, span: Span) -> Self {
        Self {
            source,
            capture_timeout,
            span,
            inner: Mutex::new(Inner { state: SchedulerState::Idle, cancel: None, task: None }),
            in_flight: Arc::new(Mutex::new(None)),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.lock().state
    }

    /// Whether the capture loop is live. False once the callback broke out of
    /// the loop, even before [`stop`](Self::stop) reaps it.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.state == SchedulerState::Running
            && inner.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start capturing `display_index` at `target_fps`, feeding every
    /// successfully captured frame to `on_frame`.
    ///
    /// `on_frame` runs on the scheduler task, one tick at a time; returning
    /// [`ControlFlow::Break`] ends the loop. Must be called within a Tokio
    /// runtime.
    pub fn start<F, Fut>(
        &self,
        display_index: u32,
        target_fps: u32,
        on_frame: F,
    ) -> Result<(), SchedulerError>
    where
        F: FnMut(Frame) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        if target_fps == 0 || target_fps > MAX_FRAME_RATE {
            return Err(SchedulerError::InvalidFrameRate(target_fps));
        }

        let mut inner = self.lock();
        if inner.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let ticker = Ticker {
            source: Arc::clone(&self.source),
            display_index,
            period_ns: 1_000_000_000 / u64::from(target_fps),
            max_lag_ticks: u64::from(target_fps),
            capture_timeout: self.capture_timeout,
            in_flight: Arc::clone(&self.in_flight),
            cancel: cancel.clone(),
            span: self.span.clone(),
        };

        inner.task = Some(tokio::spawn(ticker.run(on_frame)));
        inner.cancel = Some(cancel);
        inner.state = SchedulerState::Running;

        info!(parent: &self.span, "Display[{}] capture started at {} fps", display_index, target_fps);
        Ok(())
    }

    /// Cancel the pending tick, wait for an in-flight tick to finish, and
    /// return to `Idle`. A no-op returning `None` when already idle.
    pub async fn stop(&self) -> Option<SchedulerReport> {
        let _serial = self.stop_lock.lock().await;

        let (cancel, task) = {
            let mut inner = self.lock();
            if inner.state == SchedulerState::Idle {
                return None;
            }
            inner.state = SchedulerState::Stopping;
            (inner.cancel.take(), inner.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let report = match task {
            Some(task) => match task.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(parent: &self.span, "capture task ended abnormally: {}", e);
                    None
                }
            },
            None => None,
        };

        self.lock().state = SchedulerState::Idle;
        if let Some(r) = &report {
            info!(
                parent: &self.span,
                "capture stopped: ticks={} frames={} failed={} resyncs={}",
                r.ticks, r.frames, r.failed_captures, r.resyncs
            );
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        guard(&self.inner)
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        if let Some(cancel) = self.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

// ── Tick loop ─────────────────────────────────────────────────────────────────

struct Ticker {
    source:          Arc<dyn FrameSource>,
    display_index:   u32,
    period_ns:       u64,
    max_lag_ticks:   u64,
    capture_timeout: Duration,
    in_flight:       Arc<Mutex<Option<CaptureTask>>>,
    cancel:          CancellationToken,
    span:            Span,
}

impl Ticker {
    async fn run<F, Fut>(self, mut on_frame: F) -> SchedulerReport
    where
        F: FnMut(Frame) -> Fut + Send,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let start = Instant::now();
        let mut report = SchedulerReport::default();
        let mut tick: u64 = 0;

        loop {
            let deadline = start + Duration::from_nanos(self.period_ns.saturating_mul(tick));
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            report.ticks += 1;
            match self.capture().await {
                Ok(frame) => {
                    // Shutdown began while the screen was being read.
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    report.frames += 1;
                    trace!(parent: &self.span, "tick {} frame {}", tick, frame.id());
                    if on_frame(frame).await.is_break() {
                        debug!(parent: &self.span, "frame consumer ended the capture loop at tick {}", tick);
                        break;
                    }
                }
                Err(e) => {
                    report.failed_captures += 1;
                    warn!(parent: &self.span, "Display[{}] tick {} skipped: {}", self.display_index, tick, e);
                }
            }

            tick += 1;
            let due = start.elapsed().as_nanos() / u128::from(self.period_ns);
            let due = u64::try_from(due).unwrap_or(u64::MAX);
            if due > tick + self.max_lag_ticks {
                warn!(
                    parent: &self.span,
                    "Display[{}] capture fell {} ticks behind, skipping ahead",
                    self.display_index,
                    due - tick
                );
                report.resyncs += 1;
                tick = due;
            }
        }

        report
    }

    async fn capture(&self) -> Result<Frame, CaptureError> {
        let mut read = {
            let mut slot = guard(&self.in_flight);
            match slot.take() {
                Some(task) if !task.is_finished() => {
                    *slot = Some(task);
                    return Err(CaptureError::Failed { reason: "previous capture still running".into() });
                }
                // A finished leftover belongs to an abandoned tick; its frame is stale.
                _ => {
                    let source = Arc::clone(&self.source);
                    let index = self.display_index;
                    tokio::task::spawn_blocking(move || source.capture(index))
                }
            }
        };

        match tokio::time::timeout(self.capture_timeout, &mut read).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(CaptureError::Failed { reason: format!("capture task: {join}") }),
            Err(_) => {
                *guard(&self.in_flight) = Some(read);
                Err(CaptureError::Failed {
                    reason: format!("no frame within {:?}", self.capture_timeout),
                })
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use anyscreen_capture::TestPatternSource;
    use anyscreen_core::{DisplayInfo, Rect};
    use tokio::sync::mpsc;

    fn scheduler(source: Arc<dyn FrameSource>) -> CaptureScheduler {
        CaptureScheduler::new(source, Duration::from_secs(1), Span::none())
    }

    fn pattern() -> Arc<dyn FrameSource> {
        Arc::new(TestPatternSource::single(16, 16))
    }

    /// Fails every `fail_every`-th capture; sleeps `slow` on every `slow_every`-th.
    struct ScriptedSource {
        inner:      TestPatternSource,
        calls:      AtomicU32,
        fail_every: u32,
        slow_every: u32,
        slow:       Duration,
    }

    impl FrameSource for ScriptedSource {
        fn capture(&self, display_index: u32) -> Result<Frame, CaptureError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.slow_every > 0 && n % self.slow_every == 0 {
                std::thread::sleep(self.slow);
            }
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(CaptureError::Failed { reason: "scripted".into() });
            }
            self.inner.capture(display_index)
        }
        fn capture_region(&self, region: Rect) -> Result<Frame, CaptureError> {
            self.inner.capture_region(region)
        }
        fn enumerate_displays(&self) -> Vec<DisplayInfo> {
            self.inner.enumerate_displays()
        }
        fn is_supported(&self) -> bool {
            true
        }
    }

    fn collector() -> (
        mpsc::UnboundedSender<std::time::Instant>,
        mpsc::UnboundedReceiver<std::time::Instant>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let sched = scheduler(pattern());
        sched.start(0, 30, |_| async { ControlFlow::Continue(()) }).unwrap();
        assert_eq!(
            sched.start(0, 30, |_| async { ControlFlow::Continue(()) }),
            Err(SchedulerError::AlreadyRunning)
        );
        sched.stop().await;
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn rejects_out_of_range_rate() {
        let sched = scheduler(pattern());
        assert_eq!(
            sched.start(0, 0, |_| async { ControlFlow::Continue(()) }),
            Err(SchedulerError::InvalidFrameRate(0))
        );
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let sched = scheduler(pattern());
        assert_eq!(sched.stop().await, None);
        assert_eq!(sched.stop().await, None);
        assert_eq!(sched.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn can_restart_after_stop() {
        let sched = scheduler(pattern());
        for _ in 0..2 {
            sched.start(0, 60, |_| async { ControlFlow::Continue(()) }).unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            let report = sched.stop().await.expect("report");
            assert!(report.frames > 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mean_interval_tracks_target_rate() {
        let sched = scheduler(pattern());
        let (tx, mut rx) = collector();
        sched
            .start(0, 50, move |_| {
                let _ = tx.send(std::time::Instant::now());
                async { ControlFlow::Continue(()) }
            })
            .unwrap();

        let mut stamps = Vec::new();
        while stamps.len() < 60 {
            stamps.push(rx.recv().await.expect("tick"));
        }
        sched.stop().await;

        let span = stamps[stamps.len() - 1] - stamps[0];
        let mean_ms = span.as_secs_f64() * 1000.0 / (stamps.len() - 1) as f64;
        assert!((mean_ms - 20.0).abs() <= 2.0, "mean interval {mean_ms:.2}ms");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_ticks_do_not_accumulate_drift() {
        // Every 5th capture takes 2.5 periods.
        let source = Arc::new(ScriptedSource {
            inner: TestPatternSource::single(8, 8),
            calls: AtomicU32::new(0),
            fail_every: 0,
            slow_every: 5,
            slow: Duration::from_millis(50),
        });
        let sched = scheduler(source);
        let (tx, mut rx) = collector();
        sched
            .start(0, 50, move |_| {
                let _ = tx.send(std::time::Instant::now());
                async { ControlFlow::Continue(()) }
            })
            .unwrap();

        let mut stamps = Vec::new();
        while stamps.len() < 50 {
            stamps.push(rx.recv().await.expect("tick"));
        }
        sched.stop().await;

        // Frame k lands near first + k × 20ms, not first + k × (20ms + lag).
        let elapsed = stamps[49] - stamps[0];
        let expected = Duration::from_millis(49 * 20);
        let error = if elapsed > expected { elapsed - expected } else { expected - elapsed };
        assert!(error < Duration::from_millis(80), "cumulative error {error:?}");
    }

    #[tokio::test]
    async fn capture_failures_skip_the_tick_only() {
        let source = Arc::new(ScriptedSource {
            inner: TestPatternSource::single(8, 8),
            calls: AtomicU32::new(0),
            fail_every: 2,
            slow_every: 0,
            slow: Duration::ZERO,
        });
        let sched = scheduler(source);
        sched.start(0, 100, |_| async { ControlFlow::Continue(()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sched.is_running());
        let report = sched.stop().await.expect("report");
        assert!(report.failed_captures > 0);
        assert!(report.frames > 0);
        assert_eq!(report.ticks, report.frames + report.failed_captures);
    }

    #[tokio::test]
    async fn break_ends_the_loop() {
        let sched = scheduler(pattern());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        sched
            .start(0, 100, move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n >= 3 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!sched.is_running());
        assert_eq!(sched.state(), SchedulerState::Running);
        let report = sched.stop().await.expect("report");
        assert_eq!(report.frames, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    /// Blocks in `capture` for `hang`, recording the peak number of
    /// overlapping calls.
    struct HangingSource {
        inner:   TestPatternSource,
        hang:    Duration,
        current: AtomicU32,
        peak:    AtomicU32,
    }

    impl FrameSource for HangingSource {
        fn capture(&self, display_index: u32) -> Result<Frame, CaptureError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.hang);
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.inner.capture(display_index)
        }
        fn capture_region(&self, region: Rect) -> Result<Frame, CaptureError> {
            self.inner.capture_region(region)
        }
        fn enumerate_displays(&self) -> Vec<DisplayInfo> {
            self.inner.enumerate_displays()
        }
        fn is_supported(&self) -> bool {
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hung_capture_is_not_stacked() {
        let source = Arc::new(HangingSource {
            inner:   TestPatternSource::single(8, 8),
            hang:    Duration::from_millis(300),
            current: AtomicU32::new(0),
            peak:    AtomicU32::new(0),
        });
        let sched = CaptureScheduler::new(source.clone(), Duration::from_millis(50), Span::none());
        sched.start(0, 60, |_| async { ControlFlow::Continue(()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let report = sched.stop().await.expect("report");

        // A restart must wait for the abandoned read too.
        sched.start(0, 60, |_| async { ControlFlow::Continue(()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sched.stop().await;

        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
        assert_eq!(report.frames, 0);
        assert!(report.failed_captures > 10, "{report:?}");
    }

    #[tokio::test]
    async fn no_frames_after_stop_returns() {
        let sched = scheduler(pattern());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        sched
            .start(0, 120, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { ControlFlow::Continue(()) }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.stop().await;
        let after_stop = seen.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_stop);
    }
}
