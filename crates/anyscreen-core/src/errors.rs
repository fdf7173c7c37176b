use thiserror::Error;

/// Rejected configuration values. Surfaced before a session reaches `Running`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid dimensions {width}x{height}: both must be positive")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Invalid frame rate {0}: must be within 1..={max}", max = crate::MAX_FRAME_RATE)]
    InvalidFrameRate(u32),

    #[error("Invalid bit rate: must be positive")]
    InvalidBitRate,

    #[error("Invalid JPEG quality {0}: must be within 0..=100")]
    InvalidQuality(u8),

    #[error("Invalid client limit: must be positive")]
    InvalidClientLimit,

    #[error("Missing configuration value: {field}")]
    Missing { field: &'static str },
}

/// Failures of the screen capture primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Display {index} unavailable ({available} display(s) enumerated)")]
    Unavailable { index: u32, available: usize },

    #[error("Capture failed: {reason}")]
    Failed { reason: String },

    #[error("Screen capture is not supported in this environment")]
    Unsupported,
}

/// Failures of the video encoder collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Encoder not configured")]
    NotConfigured,

    #[error("Failed to open encoder: {reason}")]
    Open { reason: String },

    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    #[error("Frame {actual_width}x{actual_height} smaller than encoder {width}x{height}")]
    FrameMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Failed to close encoder: {reason}")]
    Close { reason: String },
}

/// Failures of a recording as a whole, as reported to whoever started it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("Encoder not configured: configure() must be called before start()")]
    EncoderNotConfigured,

    #[error("Recorder already configured")]
    AlreadyConfigured,

    #[error("Invalid recording configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Recording failed: {0}")]
    Encoder(#[from] EncoderError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler already running")]
    AlreadyRunning,

    #[error("Invalid target frame rate {0}")]
    InvalidFrameRate(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client {0} already registered")]
    DuplicateClient(String),

    #[error("Client limit reached ({limit})")]
    Full { limit: usize },
}

/// Which kind of capture session an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Recording,
    Streaming,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recording => write!(f, "recording"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Errors returned by the session control surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A {kind} session is already in progress on display {display_index}")]
    AlreadyInProgress { kind: SessionKind, display_index: u32 },

    #[error("No streaming session is running")]
    NotStreaming,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Capture unavailable: {0}")]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
