//! `CaptureService`: the control surface used by the HTTP and CLI layers.
//!
//! Holds at most one recording session and one streaming session. Each kind
//! has a slot guarding the `Idle → Starting → Running` transition, so two
//! concurrent starts of the same kind cannot both succeed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyscreen_capture::FrameSource;
use anyscreen_core::{
    CaptureError, DisplayInfo, Frame, RecordingConfig, RecordingError, SessionError, SessionKind, StreamConfig,
};
use tracing::{info, info_span, Span};

use crate::jpeg::{ImageJpegEncoder, StillEncoder};
use crate::recording::VideoEncoder;
use crate::session::{
    PipelineOptions, RecordingSession, RecordingSummary, SessionState, StreamStats,
    StreamingSession,
};
use crate::sink::Sink;
use crate::streaming::{ClientInfo, ClientWriter, StreamingClientSink};

struct Slot<S> {
    /// Display index of a session being started.
    starting: Option<u32>,
    session:  Option<Arc<S>>,
}

impl<S> Default for Slot<S> {
    fn default() -> Self {
        Self { starting: None, session: None }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CaptureService {
    source:    Arc<dyn FrameSource>,
    encoder:   Arc<dyn VideoEncoder>,
    still:     Option<Arc<dyn StillEncoder>>,
    options:   PipelineOptions,
    recording: Mutex<Slot<RecordingSession>>,
    streaming: Mutex<Slot<StreamingSession>>,
    span:      Span,
}

impl CaptureService {
    pub fn new(source: Arc<dyn FrameSource>, encoder: Arc<dyn VideoEncoder>, span: Span) -> Self {
        Self {
            source,
            encoder,
            still: None,
            options: PipelineOptions::default(),
            recording: Mutex::new(Slot::default()),
            streaming: Mutex::new(Slot::default()),
            span,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `still` for every stream instead of an `image` JPEG encoder sized
    /// to the stream's configured dimensions.
    pub fn with_still_encoder(mut self, still: Arc<dyn StillEncoder>) -> Self {
        self.still = Some(still);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    // ── Displays ──────────────────────────────────────────────────────────

    pub fn list_displays(&self) -> Vec<DisplayInfo> {
        self.source.enumerate_displays()
    }

    pub fn is_supported(&self) -> bool {
        self.source.is_supported()
    }

    /// One frame of `display_index`, independent of any session.
    pub async fn snapshot(&self, display_index: u32) -> Result<Frame, CaptureError> {
        let source = Arc::clone(&self.source);
        let limit = self.options.capture_timeout;
        let capture = tokio::task::spawn_blocking(move || source.capture(display_index));
        match tokio::time::timeout(limit, capture).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => Err(CaptureError::Failed { reason: format!("capture task: {e}") }),
            Err(_) => Err(CaptureError::Failed { reason: format!("no frame within {limit:?}") }),
        }
    }

    // ── Recording ─────────────────────────────────────────────────────────

    pub async fn start_recording(&self, config: RecordingConfig) -> Result<(), SessionError> {
        let display_index = config.display_index;
        {
            let mut slot = lock(&self.recording);
            if let Some(busy) = busy_display(&slot, |s| s.is_running(), |s| s.display_index()) {
                return Err(SessionError::AlreadyInProgress {
                    kind: SessionKind::Recording,
                    display_index: busy,
                });
            }
            slot.starting = Some(display_index);
        }

        let span = info_span!(parent: &self.span, "recording", display = display_index);
        let started = RecordingSession::start(
            Arc::clone(&self.source),
            Arc::clone(&self.encoder),
            config,
            &self.options,
            span,
        )
        .await;

        let mut slot = lock(&self.recording);
        slot.starting = None;
        slot.session = Some(started?);
        Ok(())
    }

    /// Stop the running recording and finalise its file. `Ok(None)` when no
    /// recording is running, including one that already ended on its own.
    pub async fn stop_recording(&self) -> Result<Option<RecordingSummary>, SessionError> {
        let Some(session) = lock(&self.recording).session.clone() else {
            return Ok(None);
        };
        if session.state() == SessionState::Idle {
            return Ok(None);
        }
        let summary = session.stop().await?;
        info!(parent: &self.span, "recording saved to {}", summary.output_path.display());
        Ok(Some(summary))
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.recording).session.as_ref().is_some_and(|s| s.is_running())
    }

    pub fn recording_state(&self) -> SessionState {
        slot_state(&lock(&self.recording), |s| s.state())
    }

    /// The current or most recent recording's configuration.
    pub fn recording_config(&self) -> Option<RecordingConfig> {
        lock(&self.recording).session.as_ref().map(|s| s.config().clone())
    }

    /// Wait for the current or most recent recording to end. `None` if no
    /// recording was ever started.
    pub async fn wait_recording(&self) -> Option<Result<RecordingSummary, RecordingError>> {
        let session = lock(&self.recording).session.clone()?;
        Some(session.wait().await)
    }

    // ── Streaming ─────────────────────────────────────────────────────────

    pub fn start_streaming(&self, config: StreamConfig) -> Result<(), SessionError> {
        let mut slot = lock(&self.streaming);
        if let Some(busy) = busy_display(&slot, |s| s.is_running(), |s| s.display_index()) {
            return Err(SessionError::AlreadyInProgress {
                kind: SessionKind::Streaming,
                display_index: busy,
            });
        }

        let span = info_span!(parent: &self.span, "streaming", display = config.display_index);
        let still: Arc<dyn StillEncoder> = match &self.still {
            Some(still) => Arc::clone(still),
            None => Arc::new(ImageJpegEncoder::new(config.width, config.height).with_span(span.clone())),
        };
        let session = StreamingSession::start(Arc::clone(&self.source), still, config, &self.options, span)?;
        slot.session = Some(session);
        Ok(())
    }

    /// Stop streaming and disconnect every client. Returns the final
    /// counters, or `None` when nothing was streaming.
    pub async fn stop_streaming(&self) -> Option<StreamStats> {
        let session = lock(&self.streaming).session.take()?;
        session.stop().await;
        Some(session.stats())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_session().is_some()
    }

    pub fn streaming_state(&self) -> SessionState {
        slot_state(&lock(&self.streaming), |s| s.state())
    }

    /// Configuration of the running stream.
    pub fn stream_config(&self) -> Option<StreamConfig> {
        self.streaming_session().map(|s| s.config().clone())
    }

    /// Register a sink with the running stream.
    pub async fn register_client(&self, sink: Arc<dyn Sink>) -> Result<(), SessionError> {
        let session = self.streaming_session().ok_or(SessionError::NotStreaming)?;
        session.register(sink).await
    }

    /// Create an MJPEG client writing to `writer` and register it.
    pub async fn connect_client(
        &self,
        id: impl Into<String>,
        writer: ClientWriter,
    ) -> Result<Arc<StreamingClientSink>, SessionError> {
        let session = self.streaming_session().ok_or(SessionError::NotStreaming)?;
        let sink = session.client_sink(id, writer);
        session.register(sink.clone()).await?;
        Ok(sink)
    }

    /// Remove and close a client. Returns whether it was connected.
    pub async fn unregister_client(&self, id: &str) -> bool {
        let Some(session) = lock(&self.streaming).session.clone() else {
            return false;
        };
        session.unregister(id).await
    }

    pub fn stats(&self) -> StreamStats {
        lock(&self.streaming).session.as_ref().map(|s| s.stats()).unwrap_or_default()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        lock(&self.streaming).session.as_ref().map(|s| s.clients()).unwrap_or_default()
    }

    fn streaming_session(&self) -> Option<Arc<StreamingSession>> {
        lock(&self.streaming).session.clone().filter(|s| s.is_running())
    }

    // ── Shutdown ──────────────────────────────────────────────────────────

    /// Stop both sessions. Streaming first: it has no file to finalise.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if let Some(stats) = self.stop_streaming().await {
            info!(parent: &self.span, "stream closed after {} frame(s)", stats.frames_sent);
        }
        self.stop_recording().await?;
        Ok(())
    }
}

/// Display index of a session that blocks a new start, if any.
fn busy_display<S>(
    slot: &Slot<S>,
    running: impl Fn(&S) -> bool,
    display: impl Fn(&S) -> u32,
) -> Option<u32> {
    slot.starting
        .or_else(|| slot.session.as_deref().filter(|s| running(*s)).map(display))
}

fn slot_state<S>(slot: &Slot<S>, state: impl Fn(&S) -> SessionState) -> SessionState {
    if slot.starting.is_some() {
        return SessionState::Starting;
    }
    slot.session.as_deref().map(state).unwrap_or(SessionState::Idle)
}
