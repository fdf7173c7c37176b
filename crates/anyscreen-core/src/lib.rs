pub mod config;
pub mod errors;
pub mod types;

pub use config::{RecordingConfig, StreamConfig, VideoCodec, MAX_FRAME_RATE};
pub use errors::*;
pub use types::*;
