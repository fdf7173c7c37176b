//! Recording and streaming sessions: one capture loop wired to its sinks.
//!
//! ```text
//!  RecordingSession                      StreamingSession
//!  ────────────────                      ────────────────
//!  CaptureScheduler                      CaptureScheduler
//!        │                                     │
//!   Distributor ──► RecordingSink          Distributor (FrameGate)
//!        │                                     │
//!   fatal? ──► supervisor ──► finish()     ClientRegistry ──► StreamingClientSink × N
//! ```
//!
//! Shutdown order is always: cancel the scheduler (no new frame is admitted),
//! wait for the in-flight tick, then flush and close the sinks.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyscreen_capture::FrameSource;
use anyscreen_core::{EncoderError, RecordingConfig, RecordingError, SessionError, StreamConfig};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Span};

use crate::distributor::Distributor;
use crate::jpeg::{SharedJpeg, StillEncoder};
use crate::recording::{RecordingSink, VideoEncoder};
use crate::registry::ClientRegistry;
use crate::scheduler::CaptureScheduler;
use crate::sink::Sink;
use crate::streaming::{ClientInfo, ClientWriter, StreamingClientSink};

// MARK: - Shared types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Timeouts bounding every blocking step of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Longest a single screen read may take before the tick is skipped.
    pub capture_timeout:       Duration,
    /// Longest a client may take to accept one MJPEG part.
    pub sink_write_timeout:    Duration,
    /// Longest the video encoder may take to accept one frame.
    pub encoder_write_timeout: Duration,
    /// Capture rate for streaming sessions when it should differ from the
    /// stream rate. Frames above the stream rate are dropped by the gate.
    pub stream_capture_fps:    Option<u32>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            capture_timeout:       Duration::from_secs(1),
            sink_write_timeout:    Duration::from_secs(2),
            encoder_write_timeout: Duration::from_secs(5),
            stream_capture_fps:    None,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// MARK: - RecordingSession

/// What a finished recording produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingSummary {
    pub frames_written: u64,
    pub duration:       Duration,
    pub output_path:    PathBuf,
}

type Outcome = Result<RecordingSummary, RecordingError>;

pub struct RecordingSession {
    config:     RecordingConfig,
    scheduler:  CaptureScheduler,
    sink:       Arc<RecordingSink>,
    registry:   Arc<ClientRegistry>,
    started:    Instant,
    state:      Mutex<SessionState>,
    finished:   tokio::sync::Mutex<Option<Outcome>>,
    outcome_tx: watch::Sender<Option<Outcome>>,
    supervisor: CancellationToken,
    span:       Span,
}

impl RecordingSession {
    /// Validate, open the encoder and start capturing. On error nothing is
    /// left running.
    pub async fn start(
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn VideoEncoder>,
        config: RecordingConfig,
        options: &PipelineOptions,
        span: Span,
    ) -> Result<Arc<Self>, SessionError> {
        config.validate()?;
        source.display(config.display_index)?;

        let sink = Arc::new(RecordingSink::new(
            config.output_path.to_string_lossy(),
            encoder,
            options.encoder_write_timeout,
            span.clone(),
        ));
        sink.configure(config.clone())?;
        sink.start().await?;

        let registry = Arc::new(ClientRegistry::new(1, span.clone()));
        registry.register(sink.clone())?;
        let distributor = Arc::new(Distributor::new(Arc::clone(&registry), span.clone()));

        let (outcome_tx, _) = watch::channel(None);
        let session = Arc::new(Self {
            scheduler: CaptureScheduler::new(source, options.capture_timeout, span.clone()),
            config,
            sink,
            registry,
            started: Instant::now(),
            state: Mutex::new(SessionState::Running),
            finished: tokio::sync::Mutex::new(None),
            outcome_tx,
            supervisor: CancellationToken::new(),
            span,
        });

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let scheduled = session.scheduler.start(
            session.config.display_index,
            session.config.frame_rate,
            move |frame| {
                let hub = Arc::clone(&distributor);
                let fatal_tx = fatal_tx.clone();
                async move {
                    match hub.broadcast(&frame).await.fatal {
                        Some(e) => {
                            let _ = fatal_tx.send(e);
                            ControlFlow::Break(())
                        }
                        None => ControlFlow::Continue(()),
                    }
                }
            },
        );
        if let Err(e) = scheduled {
            let _ = session.sink.stop().await;
            return Err(e.into());
        }

        tokio::spawn(supervise(Arc::downgrade(&session), fatal_rx, session.supervisor.clone()));
        info!(
            parent: &session.span,
            "recording display {} → {}",
            session.config.display_index,
            session.config.output_path.display()
        );
        Ok(session)
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn display_index(&self) -> u32 {
        self.config.display_index
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn frames_written(&self) -> u64 {
        self.sink.frames_written()
    }

    /// Stop capturing and finalise the file. Idempotent: every call after
    /// the first returns the same outcome.
    pub async fn stop(&self) -> Outcome {
        self.finish(None).await
    }

    /// Resolve once the session has ended, by `stop` or by a fatal error.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.outcome_tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(dropped()))
    }

    async fn finish(&self, fatal: Option<RecordingError>) -> Outcome {
        let mut finished = self.finished.lock().await;
        if let Some(outcome) = finished.as_ref() {
            return outcome.clone();
        }

        *lock(&self.state) = SessionState::Stopping;
        self.supervisor.cancel();
        self.scheduler.stop().await;
        let closed = self.sink.stop().await;
        self.registry.drain().await;

        // A failure can land between the last tick and this stop.
        let fatal = fatal.or_else(|| self.sink.failure());
        let outcome = match (fatal, closed) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(RecordingSummary {
                frames_written: self.sink.frames_written(),
                duration: self.started.elapsed(),
                output_path: self.config.output_path.clone(),
            }),
        };
        match &outcome {
            Ok(summary) => info!(
                parent: &self.span,
                "recording finished: {} frame(s) in {:.1}s",
                summary.frames_written,
                summary.duration.as_secs_f64()
            ),
            Err(e) => error!(parent: &self.span, "recording ended with error: {}", e),
        }

        *finished = Some(outcome.clone());
        *lock(&self.state) = SessionState::Idle;
        self.outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }
}

fn dropped() -> RecordingError {
    RecordingError::Encoder(EncoderError::Close { reason: "recording session dropped".into() })
}

/// Ends the session when a sink reports a fatal error.
async fn supervise(
    session: Weak<RecordingSession>,
    mut fatal_rx: mpsc::UnboundedReceiver<RecordingError>,
    cancel: CancellationToken,
) {
    let fatal = tokio::select! {
        _ = cancel.cancelled() => return,
        fatal = fatal_rx.recv() => fatal,
    };
    if let (Some(e), Some(session)) = (fatal, session.upgrade()) {
        session.finish(Some(e)).await;
    }
}

// MARK: - StreamingSession

/// Counters of one streaming session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub frames_sent:       u64,
    pub bytes_sent:        u64,
    pub client_count:      usize,
    pub uptime:            Duration,
    pub avg_fps:           f64,
    pub avg_bytes_per_sec: f64,
    pub streaming:         bool,
}

pub struct StreamingSession {
    config:        StreamConfig,
    registry:      Arc<ClientRegistry>,
    distributor:   Arc<Distributor>,
    scheduler:     CaptureScheduler,
    jpeg:          Arc<SharedJpeg>,
    write_timeout: Duration,
    started:       Instant,
    ended:         Mutex<Option<Instant>>,
    state:         Mutex<SessionState>,
    stop_lock:     tokio::sync::Mutex<()>,
    span:          Span,
}

impl StreamingSession {
    pub fn start(
        source: Arc<dyn FrameSource>,
        still: Arc<dyn StillEncoder>,
        config: StreamConfig,
        options: &PipelineOptions,
        span: Span,
    ) -> Result<Arc<Self>, SessionError> {
        config.validate()?;
        source.display(config.display_index)?;

        let registry = Arc::new(ClientRegistry::new(config.max_clients, span.clone()));
        let distributor = Arc::new(Distributor::rate_limited(
            Arc::clone(&registry),
            config.min_frame_interval(),
            span.clone(),
        ));
        let session = Arc::new(Self {
            jpeg: Arc::new(SharedJpeg::new(still, config.quality)),
            scheduler: CaptureScheduler::new(source, options.capture_timeout, span.clone()),
            write_timeout: options.sink_write_timeout,
            config,
            registry,
            distributor: Arc::clone(&distributor),
            started: Instant::now(),
            ended: Mutex::new(None),
            state: Mutex::new(SessionState::Running),
            stop_lock: tokio::sync::Mutex::new(()),
            span,
        });

        let capture_fps = options.stream_capture_fps.unwrap_or(session.config.frame_rate);
        session.scheduler.start(session.config.display_index, capture_fps, move |frame| {
            let hub = Arc::clone(&distributor);
            async move {
                match hub.broadcast(&frame).await.fatal {
                    Some(_) => ControlFlow::Break(()),
                    None => ControlFlow::Continue(()),
                }
            }
        })?;

        info!(
            parent: &session.span,
            "streaming display {} at {} fps (capture {} fps), quality {}",
            session.config.display_index,
            session.config.frame_rate,
            capture_fps,
            session.config.quality
        );
        Ok(session)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn display_index(&self) -> u32 {
        self.config.display_index
    }

    pub fn state(&self) -> SessionState {
        let state = *lock(&self.state);
        if state == SessionState::Running && !self.scheduler.is_running() {
            return SessionState::Idle;
        }
        state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// An MJPEG client sink writing to `writer`, sharing this session's
    /// JPEG encoding. Not registered yet.
    pub fn client_sink(&self, id: impl Into<String>, writer: ClientWriter) -> Arc<StreamingClientSink> {
        Arc::new(StreamingClientSink::new(id, writer, Arc::clone(&self.jpeg), self.write_timeout, self.span.clone()))
    }

    /// Add a client. A client that lands while `stop` is draining is taken
    /// back out and closed, so none outlives the session.
    pub async fn register(&self, sink: Arc<dyn Sink>) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotStreaming);
        }
        let id = sink.id().to_owned();
        self.registry.register(sink)?;
        if !self.is_running() {
            // stop() marks the session before draining; whichever of us
            // removes the entry closes it.
            if let Some(sink) = self.registry.unregister(&id).await {
                sink.close().await;
            }
            return Err(SessionError::NotStreaming);
        }
        info!(parent: &self.span, "client {} connected ({} total)", id, self.registry.len());
        Ok(())
    }

    /// Remove and close a client. Returns whether it was registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let Some(sink) = self.registry.unregister(id).await else {
            return false;
        };
        sink.close().await;
        info!(parent: &self.span, "client {} disconnected ({} left)", id, self.registry.len());
        true
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|reg| {
                let counters = reg.sink().counters();
                ClientInfo {
                    id: reg.id().to_owned(),
                    active: reg.is_active(),
                    last_write_age: counters.last_write.map(|t| t.elapsed()),
                    parts_sent: counters.parts_sent,
                }
            })
            .collect()
    }

    pub fn stats(&self) -> StreamStats {
        let counters = self.distributor.counters();
        let end = lock(&self.ended).unwrap_or_else(Instant::now);
        let uptime = end.saturating_duration_since(self.started);
        let secs = uptime.as_secs_f64();
        let per_sec = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        StreamStats {
            frames_sent: counters.frames_sent,
            bytes_sent: counters.bytes_sent,
            client_count: self.registry.len(),
            uptime,
            avg_fps: per_sec(counters.frames_sent),
            avg_bytes_per_sec: per_sec(counters.bytes_sent),
            streaming: self.is_running(),
        }
    }

    /// Stop capturing, then close and forget every client. Idempotent.
    pub async fn stop(&self) {
        let _serial = self.stop_lock.lock().await;
        if lock(&self.ended).is_some() {
            return;
        }

        *lock(&self.state) = SessionState::Stopping;
        self.scheduler.stop().await;
        let clients = self.registry.drain().await;
        let closed = clients.len();
        for sink in clients {
            sink.close().await;
        }
        *lock(&self.ended) = Some(Instant::now());
        *lock(&self.state) = SessionState::Idle;

        let stats = self.stats();
        info!(
            parent: &self.span,
            "streaming stopped: {} frame(s), {} byte(s), {} client(s) closed",
            stats.frames_sent,
            stats.bytes_sent,
            closed
        );
    }
}

// MARK: - Tests
