//! AnyScreen capture / distribution pipeline.
//!
//! ```text
//! FrameSource ──► CaptureScheduler ──► Distributor ──► RecordingSink ──► VideoEncoder (ffmpeg)
//!                  (fixed-rate ticks)   (broadcast)  └─► StreamingClientSink × N ──► MJPEG bytes
//!                                           │
//!                                    ClientRegistry (concurrent add / remove / evict)
//! ```
//!
//! [`CaptureService`] is the entry point: it owns at most one recording and
//! one streaming session and exposes start / stop / register / stats.
//!
//! Every component takes a [`tracing::Span`] at construction and logs under
//! it; nothing here installs a subscriber.

pub mod distributor;
pub mod ffmpeg;
pub mod jpeg;
pub mod mjpeg;
pub mod recording;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod sink;
pub mod streaming;

pub use distributor::{BroadcastReport, Distributor, DistributorCounters, FrameGate};
pub use ffmpeg::FfmpegEncoder;
pub use jpeg::{ImageJpegEncoder, SharedJpeg, StillEncoder, StillFormat};
pub use recording::{EncodeHandle, EncoderAbort, RecorderPhase, RecordingSink, VideoEncoder};
pub use registry::{ClientRegistry, Registration};
pub use scheduler::{CaptureScheduler, SchedulerReport, SchedulerState};
pub use service::CaptureService;
pub use session::{
    PipelineOptions, RecordingSession, RecordingSummary, SessionState, StreamStats,
    StreamingSession,
};
pub use sink::{DeliveryError, Sink, SinkCounters};
pub use streaming::{ClientInfo, ClientWriter, StreamingClientSink};
