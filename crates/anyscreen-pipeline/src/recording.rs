//! `RecordingSink`: feeds captured frames into a video encoder.
//!
//! ```text
//!  Unconfigured ──configure()──► Configured ──start()──► Running ──stop()──► Stopped
//!                                                          │
//!                                              encoder error (fatal)
//!                                                          ▼
//!                                                        Failed ──stop()──► Stopped
//! ```
//!
//! The encoder handle is exclusively owned by this sink. Encoder calls block
//! (file and pipe I/O), so they run on the blocking pool under a timeout.
//! Any encoder failure is fatal: the sink stops accepting frames and reports
//! [`DeliveryError::Fatal`] so the owning session shuts down instead of
//! writing a silently truncated file.
//!
//! `stop` waits at most the close timeout for the encoder to finish. A
//! handle stuck in a write is then torn down through its [`EncoderAbort`]
//! hook, which lives outside the handle lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyscreen_core::{EncoderError, Frame, RecordingConfig, RecordingError};
use async_trait::async_trait;
use tracing::{debug, error, info, Span};

use crate::sink::{DeliveryError, Sink, SinkCounters};

// ── Encoder boundary ──────────────────────────────────────────────────────────

/// Opens encoders. One `open` per recording.
pub trait VideoEncoder: Send + Sync {
    fn open(&self, config: &RecordingConfig) -> Result<Box<dyn EncodeHandle>, EncoderError>;
}

/// A live encoder writing one output file.
pub trait EncodeHandle: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    /// Flush and finalise the output.
    fn close(self: Box<Self>) -> Result<(), EncoderError>;

    /// A way to tear the encoder down while another thread is inside
    /// `write_frame` or `close`.
    fn abort_handle(&self) -> Option<Arc<dyn EncoderAbort>> {
        None
    }
}

/// Forcibly stops a running encoder. Must not block on the handle itself.
pub trait EncoderAbort: Send + Sync {
    fn abort(&self);
}

/// Default bound on finalising a recording.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// ── RecordingSink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderPhase {
    Unconfigured,
    Configured,
    Running,
    Failed,
    Stopped,
}

type SharedHandle = Arc<Mutex<Option<Box<dyn EncodeHandle>>>>;

pub struct RecordingSink {
    id:             String,
    encoder:        Arc<dyn VideoEncoder>,
    write_timeout:  Duration,
    close_timeout:  Duration,
    phase:          Mutex<RecorderPhase>,
    config:         Mutex<Option<RecordingConfig>>,
    handle:         SharedHandle,
    aborter:        Mutex<Option<Arc<dyn EncoderAbort>>>,
    frames_written: AtomicU64,
    bytes_in:       AtomicU64,
    failure:        Mutex<Option<RecordingError>>,
    span:           Span,
}

impl RecordingSink {
    pub fn new(
        id: impl Into<String>,
        encoder: Arc<dyn VideoEncoder>,
        write_timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            id: id.into(),
            encoder,
            write_timeout,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            phase: Mutex::new(RecorderPhase::Unconfigured),
            config: Mutex::new(None),
            handle: Arc::new(Mutex::new(None)),
            aborter: Mutex::new(None),
            frames_written: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            failure: Mutex::new(None),
            span,
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn phase(&self) -> RecorderPhase {
        *lock(&self.phase)
    }

    pub fn is_running(&self) -> bool {
        self.phase() == RecorderPhase::Running
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// The encoder error that failed this recording, if any.
    pub fn failure(&self) -> Option<RecordingError> {
        lock(&self.failure).clone()
    }

    pub fn config(&self) -> Option<RecordingConfig> {
        lock(&self.config).clone()
    }

    /// Accept the recording parameters. Allowed once.
    pub fn configure(&self, config: RecordingConfig) -> Result<(), RecordingError> {
        config.validate()?;
        let mut phase = lock(&self.phase);
        if *phase != RecorderPhase::Unconfigured {
            return Err(RecordingError::AlreadyConfigured);
        }
        debug!(
            parent: &self.span,
            "recorder configured: {}x{} @ {} fps, {:?} → {}",
            config.width,
            config.height,
            config.frame_rate,
            config.codec,
            config.output_path.display()
        );
        *lock(&self.config) = Some(config);
        *phase = RecorderPhase::Configured;
        Ok(())
    }

    /// Open the encoder. A no-op when already running.
    pub async fn start(&self) -> Result<(), RecordingError> {
        let config = {
            let phase = lock(&self.phase);
            match *phase {
                RecorderPhase::Running => return Ok(()),
                RecorderPhase::Configured => {}
                _ => return Err(RecordingError::EncoderNotConfigured),
            }
            lock(&self.config).clone().ok_or(RecordingError::EncoderNotConfigured)?
        };

        let encoder = Arc::clone(&self.encoder);
        let opened = tokio::task::spawn_blocking(move || encoder.open(&config))
            .await
            .map_err(|e| EncoderError::Open { reason: format!("open task: {e}") })
            .and_then(|r| r);

        match opened {
            Ok(handle) => {
                *lock(&self.aborter) = handle.abort_handle();
                *lock(&self.handle) = Some(handle);
                *lock(&self.phase) = RecorderPhase::Running;
                info!(parent: &self.span, "recording {} started", self.id);
                Ok(())
            }
            Err(e) => {
                *lock(&self.phase) = RecorderPhase::Failed;
                error!(parent: &self.span, "recording {} could not start: {}", self.id, e);
                Err(e.into())
            }
        }
    }

    /// Flush and close the encoder. Closing happens at most once; later calls
    /// and calls before `start` are no-ops. An encoder that has not finished
    /// within the close timeout is aborted and reported as a close error.
    pub async fn stop(&self) -> Result<(), RecordingError> {
        {
            let mut phase = lock(&self.phase);
            match *phase {
                RecorderPhase::Running | RecorderPhase::Failed => *phase = RecorderPhase::Stopped,
                _ => return Ok(()),
            }
        }

        let slot = Arc::clone(&self.handle);
        let close = tokio::task::spawn_blocking(move || match lock(&slot).take() {
            Some(handle) => handle.close(),
            None => Ok(()),
        });
        let aborter = lock(&self.aborter).take();

        let closed = match tokio::time::timeout(self.close_timeout, close).await {
            Ok(joined) => joined
                .map_err(|e| EncoderError::Close { reason: format!("close task: {e}") })
                .and_then(|r| r),
            Err(_) => {
                if let Some(aborter) = aborter {
                    aborter.abort();
                }
                Err(EncoderError::Close {
                    reason: format!("encoder did not finish within {:?}", self.close_timeout),
                })
            }
        };

        match closed {
            Ok(()) => {
                info!(parent: &self.span, "recording {} finalised: {} frame(s)", self.id, self.frames_written());
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, "recording {} did not close cleanly: {}", self.id, e);
                Err(e.into())
            }
        }
    }

    fn fail(&self, e: EncoderError) -> DeliveryError {
        {
            let mut phase = lock(&self.phase);
            if *phase == RecorderPhase::Running {
                *phase = RecorderPhase::Failed;
            }
        }
        let err = RecordingError::Encoder(e);
        lock(&self.failure).get_or_insert_with(|| err.clone());
        DeliveryError::Fatal(err)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, frame: &Frame) -> Result<usize, DeliveryError> {
        if !self.is_running() {
            return Ok(0);
        }

        let slot = Arc::clone(&self.handle);
        let owned = frame.clone();
        let write = tokio::task::spawn_blocking(move || match lock(&slot).as_mut() {
            Some(handle) => handle.write_frame(&owned),
            None => Err(EncoderError::NotConfigured),
        });

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(Ok(()))) => {
                let len = frame.data().len();
                self.frames_written.fetch_add(1, Ordering::Relaxed);
                self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
                Ok(len)
            }
            Ok(Ok(Err(e))) => Err(self.fail(e)),
            Ok(Err(join)) => Err(self.fail(EncoderError::EncodingFailed { reason: format!("encode task: {join}") })),
            Err(_) => Err(self.fail(EncoderError::EncodingFailed {
                reason: format!("encoder did not accept a frame within {:?}", self.write_timeout),
            })),
        }
    }

    async fn close(&self) {
        // Errors are already logged by stop().
        let _ = self.stop().await;
    }

    fn counters(&self) -> SinkCounters {
        SinkCounters {
            parts_sent: self.frames_written(),
            bytes_sent: self.bytes_in.load(Ordering::Relaxed),
            last_write: None,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
