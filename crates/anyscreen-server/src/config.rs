//! Server configuration.
//!
//! Layered in this order, later layers winning:
//!
//! ```text
//! built-in defaults ──► JSON file (--config) ──► ANYSCREEN_* env ──► CLI flags
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use anyscreen_capture::SourceKind;
use anyscreen_core::{RecordingConfig, StreamConfig};
use anyscreen_pipeline::PipelineOptions;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "ANYSCREEN_";

// MARK: - ServerConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capture backend: `test` or (with the `gstreamer` feature) `x11`.
    pub source:    String,
    /// ffmpeg binary. Resolved from `PATH` when unset.
    pub ffmpeg:    Option<PathBuf>,
    pub stream:    StreamConfig,
    pub recording: RecordingConfig,
    pub timeouts:  Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            source:    "test".to_owned(),
            ffmpeg:    None,
            stream:    StreamConfig::default(),
            recording: RecordingConfig::default(),
            timeouts:  Timeouts::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid with the JSON file at `path` if one is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn apply(&mut self, o: &Overrides) {
        if let Some(host) = &o.host {
            self.stream.host = host.clone();
        }
        if let Some(port) = o.port {
            self.stream.port = port;
        }
        if let Some(fps) = o.fps {
            self.stream.frame_rate = fps;
            self.recording.frame_rate = fps;
        }
        if let Some(quality) = o.quality {
            self.stream.quality = quality;
        }
        if let Some(display) = o.display {
            self.stream.display_index = display;
            self.recording.display_index = display;
        }
        if let Some(max) = o.max_clients {
            self.stream.max_clients = max;
        }
        if let Some(source) = &o.source {
            self.source = source.clone();
        }
        if let Some(ffmpeg) = &o.ffmpeg {
            self.ffmpeg = Some(ffmpeg.clone());
        }
        if let Some(output) = &o.output {
            self.recording.output_path = output.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.source_kind()?;
        self.stream.validate().context("stream settings")?;
        self.recording.validate().context("recording settings")?;
        Ok(())
    }

    pub fn source_kind(&self) -> Result<SourceKind> {
        self.source.parse().map_err(|e: String| anyhow!(e))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            capture_timeout:       Duration::from_millis(self.timeouts.capture_ms),
            sink_write_timeout:    Duration::from_millis(self.timeouts.client_write_ms),
            encoder_write_timeout: Duration::from_millis(self.timeouts.encoder_write_ms),
            stream_capture_fps:    None,
        }
    }
}

// MARK: - Timeouts

/// Pipeline timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub capture_ms:       u64,
    pub client_write_ms:  u64,
    pub encoder_write_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        let defaults = PipelineOptions::default();
        Self {
            capture_ms:       defaults.capture_timeout.as_millis() as u64,
            client_write_ms:  defaults.sink_write_timeout.as_millis() as u64,
            encoder_write_ms: defaults.encoder_write_timeout.as_millis() as u64,
        }
    }
}

// MARK: - Overrides

/// Individual settings supplied by the environment or the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub host:        Option<String>,
    pub port:        Option<u16>,
    pub fps:         Option<u32>,
    pub quality:     Option<u8>,
    pub display:     Option<u32>,
    pub max_clients: Option<usize>,
    pub source:      Option<String>,
    pub ffmpeg:      Option<PathBuf>,
    pub output:      Option<PathBuf>,
}

impl Overrides {
    /// Collect `ANYSCREEN_*` variables. Unknown names are ignored; a value
    /// that does not parse is an error.
    pub fn from_env<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut o = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "HOST" => o.host = Some(value),
                "PORT" => o.port = Some(parse(&key, &value)?),
                "FPS" => o.fps = Some(parse(&key, &value)?),
                "QUALITY" => o.quality = Some(parse(&key, &value)?),
                "DISPLAY" => o.display = Some(parse(&key, &value)?),
                "MAX_CLIENTS" => o.max_clients = Some(parse(&key, &value)?),
                "SOURCE" => o.source = Some(value),
                "FFMPEG" => o.ffmpeg = Some(PathBuf::from(value)),
                "OUTPUT" => o.output = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(o)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e| anyhow!("{key}={value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyscreen_core::VideoCodec;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ServerConfig::from_json(
            r#"{
                "stream": { "port": 9090, "maxClients": 3 },
                "recording": { "codec": "vp9", "outputFile": "out/demo.mkv", "format": "mkv" },
                "timeouts": { "client_write_ms": 500 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.stream.port, 9090);
        assert_eq!(cfg.stream.max_clients, 3);
        assert_eq!(cfg.stream.frame_rate, 30);
        assert_eq!(cfg.recording.codec, VideoCodec::Vp9);
        assert_eq!(cfg.recording.output_path, PathBuf::from("out/demo.mkv"));
        assert_eq!(cfg.recording.width, 1280);
        assert_eq!(cfg.source, "test");

        let options = cfg.pipeline_options();
        assert_eq!(options.sink_write_timeout, Duration::from_millis(500));
        assert_eq!(options.capture_timeout, Duration::from_secs(1));
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_codec_is_rejected() {
        assert!(ServerConfig::from_json(r#"{ "recording": { "codec": "theora" } }"#).is_err());
    }

    #[test]
    fn env_overrides_are_parsed() {
        let o = Overrides::from_env(env(&[
            ("ANYSCREEN_PORT", "7000"),
            ("ANYSCREEN_FPS", " 15 "),
            ("ANYSCREEN_OUTPUT", "/tmp/rec.mp4"),
            ("ANYSCREEN_UNRELATED", "x"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();
        assert_eq!(o.port, Some(7000));
        assert_eq!(o.fps, Some(15));
        assert_eq!(o.output, Some(PathBuf::from("/tmp/rec.mp4")));
        assert_eq!(o.host, None);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = Overrides::from_env(env(&[("ANYSCREEN_QUALITY", "high")])).unwrap_err();
        assert!(err.to_string().contains("ANYSCREEN_QUALITY"), "{err}");
    }

    #[test]
    fn later_layers_win() {
        let mut cfg = ServerConfig::from_json(r#"{ "stream": { "port": 9090, "quality": 50 } }"#).unwrap();
        cfg.apply(&Overrides::from_env(env(&[("ANYSCREEN_PORT", "7000")])).unwrap());
        cfg.apply(&Overrides { port: Some(6000), display: Some(1), ..Overrides::default() });

        assert_eq!(cfg.stream.port, 6000);
        assert_eq!(cfg.stream.quality, 50);
        assert_eq!(cfg.stream.display_index, 1);
        assert_eq!(cfg.recording.display_index, 1);
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = ServerConfig::default();
        cfg.apply(&Overrides { fps: Some(240), ..Overrides::default() });
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig { source: "wayland".into(), ..ServerConfig::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("wayland"));
    }
}
