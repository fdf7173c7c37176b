//! Doubles shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyscreen_capture::TestPatternSource;
use anyscreen_core::{EncoderError, Frame, RecordingConfig};
use anyscreen_pipeline::{DeliveryError, EncodeHandle, Sink, VideoEncoder};
use async_trait::async_trait;

pub fn pattern(width: u32, height: u32) -> Arc<TestPatternSource> {
    Arc::new(TestPatternSource::single(width, height))
}

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond().await
}

// ── Encoder ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingEncoder {
    pub opens:     AtomicU32,
    pub writes:    Arc<AtomicU32>,
    pub closes:    Arc<AtomicU32>,
    /// Writes numbered `fail_from` and later fail.
    pub fail_from: Option<u32>,
}

impl CountingEncoder {
    pub fn failing_from(n: u32) -> Self {
        Self { fail_from: Some(n), ..Self::default() }
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

struct CountingHandle {
    writes:    Arc<AtomicU32>,
    closes:    Arc<AtomicU32>,
    fail_from: Option<u32>,
}

impl VideoEncoder for CountingEncoder {
    fn open(&self, _config: &RecordingConfig) -> Result<Box<dyn EncodeHandle>, EncoderError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingHandle {
            writes:    Arc::clone(&self.writes),
            closes:    Arc::clone(&self.closes),
            fail_from: self.fail_from,
        }))
    }
}

impl EncodeHandle for CountingHandle {
    fn write_frame(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_from {
            Some(from) if n >= from => Err(EncoderError::EncodingFailed { reason: "No space left on device".into() }),
            _ => Ok(()),
        }
    }

    fn close(self: Box<Self>) -> Result<(), EncoderError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Counts deliveries; can be told to start failing.
pub struct ProbeSink {
    id:        String,
    delivered: AtomicU32,
    broken:    AtomicBool,
    panics:    bool,
}

impl ProbeSink {
    pub fn healthy(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.into(), delivered: AtomicU32::new(0), broken: AtomicBool::new(false), panics: false })
    }

    pub fn broken(id: &str) -> Arc<Self> {
        let probe = Self::healthy(id);
        probe.break_now();
        probe
    }

    pub fn panicking(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.into(), delivered: AtomicU32::new(0), broken: AtomicBool::new(false), panics: true })
    }

    pub fn break_now(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for ProbeSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, frame: &Frame) -> Result<usize, DeliveryError> {
        if self.panics {
            panic!("probe {} panicked", self.id);
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(DeliveryError::disconnected("connection reset by peer"));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(frame.data().len())
    }

    async fn close(&self) {}
}
