use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Highest accepted capture / stream rate.
pub const MAX_FRAME_RATE: u32 = 120;

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Mpeg4,
    Mjpeg,
    Vp9,
}

impl VideoCodec {
    /// ffmpeg encoder name for `-c:v`.
    pub fn ffmpeg_encoder(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
            Self::Mpeg4 => "mpeg4",
            Self::Mjpeg => "mjpeg",
            Self::Vp9 => "libvpx-vp9",
        }
    }
}

// MARK: - RecordingConfig

/// Settings for one local recording session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub width: u32,
    pub height: u32,
    #[serde(alias = "frameRate")]
    pub frame_rate: u32,
    /// Target video bit rate, bits per second.
    #[serde(alias = "bitRate")]
    pub bit_rate: u64,
    /// Container format (`mp4`, `mkv`, `avi`, ...).
    pub format: String,
    pub codec: VideoCodec,
    #[serde(alias = "outputFile")]
    pub output_path: PathBuf,
    #[serde(alias = "screenIndex")]
    pub display_index: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            bit_rate: 2_000_000,
            format: "mp4".to_owned(),
            codec: VideoCodec::H264,
            output_path: PathBuf::from("recording.mp4"),
            display_index: 0,
        }
    }
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_dimensions(self.width, self.height)?;
        check_frame_rate(self.frame_rate)?;
        if self.bit_rate == 0 {
            return Err(ConfigError::InvalidBitRate);
        }
        if self.format.trim().is_empty() {
            return Err(ConfigError::Missing { field: "format" });
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing { field: "output_path" });
        }
        Ok(())
    }

    /// Capture period implied by `frame_rate`.
    pub fn frame_interval(&self) -> Duration {
        interval_for(self.frame_rate)
    }
}

// MARK: - StreamConfig

/// Settings for one MJPEG broadcast session. Shared by every client of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    #[serde(alias = "frameRate")]
    pub frame_rate: u32,
    /// JPEG quality, 0–100.
    pub quality: u8,
    pub host: String,
    pub port: u16,
    #[serde(alias = "screenIndex")]
    pub display_index: u32,
    #[serde(alias = "maxClients")]
    pub max_clients: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30,
            quality: 80,
            host: "localhost".to_owned(),
            port: 8080,
            display_index: 0,
            max_clients: 10,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_dimensions(self.width, self.height)?;
        check_frame_rate(self.frame_rate)?;
        if self.quality > 100 {
            return Err(ConfigError::InvalidQuality(self.quality));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidClientLimit);
        }
        Ok(())
    }

    /// Minimum spacing between frames handed to clients.
    pub fn min_frame_interval(&self) -> Duration {
        interval_for(self.frame_rate)
    }
}

// MARK: - Helpers

fn check_dimensions(width: u32, height: u32) -> Result<(), ConfigError> {
    if width == 0 || height == 0 {
        return Err(ConfigError::InvalidDimensions { width, height });
    }
    Ok(())
}

fn check_frame_rate(fps: u32) -> Result<(), ConfigError> {
    if fps == 0 || fps > MAX_FRAME_RATE {
        return Err(ConfigError::InvalidFrameRate(fps));
    }
    Ok(())
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)))
}
