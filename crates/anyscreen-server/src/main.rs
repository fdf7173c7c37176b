//! AnyScreen: record a display to a video file or stream it to browsers.
//!
//! ```text
//! capture source ──► CaptureService ──► RecordingSink ──► ffmpeg ──► file
//!  (test / x11)                     └─► MJPEG clients ──► GET /stream/{index}
//! ```
//!
//! `anyscreen serve` (the default) runs the HTTP server; `anyscreen record`
//! records without it; `anyscreen snapshot` saves one still image;
//! `anyscreen displays` lists what can be captured.

mod config;
mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use anyscreen_capture::{open_source, FrameSource};
use anyscreen_pipeline::{CaptureService, FfmpegEncoder, RecordingSummary, StillFormat};
use clap::{Args, Parser, Subcommand};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Overrides, ServerConfig};

/// AnyScreen - screen recording and MJPEG streaming
#[derive(Parser, Debug)]
#[command(name = "anyscreen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and MJPEG streams (default)
    Serve,
    /// List capturable displays
    Displays {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Record a display until Ctrl-C or the duration elapses
    Record {
        /// Output file (container taken from the configured format)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Save one frame of a display as a JPEG or PNG
    Snapshot {
        /// Output image; the extension picks the format
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct SettingArgs {
    /// Address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Frames per second (1-120)
    #[arg(long, global = true)]
    fps: Option<u32>,

    /// JPEG quality for streams (0-100)
    #[arg(long, global = true)]
    quality: Option<u8>,

    /// Display index
    #[arg(long, global = true)]
    display: Option<u32>,

    /// Capture source: test, x11
    #[arg(long, global = true)]
    source: Option<String>,

    /// ffmpeg binary
    #[arg(long, global = true)]
    ffmpeg: Option<PathBuf>,

    /// Concurrent stream clients
    #[arg(long, global = true)]
    max_clients: Option<usize>,
}

impl From<SettingArgs> for Overrides {
    fn from(a: SettingArgs) -> Self {
        Self {
            host:        a.host,
            port:        a.port,
            fps:         a.fps,
            quality:     a.quality,
            display:     a.display,
            max_clients: a.max_clients,
            source:      a.source,
            ffmpeg:      a.ffmpeg,
            output:      None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    let mut cli_overrides = Overrides::from(cli.settings);
    if let Command::Record { output: Some(output), .. } = &command {
        cli_overrides.output = Some(output.clone());
    }

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    config.apply(&Overrides::from_env(std::env::vars())?);
    config.apply(&cli_overrides);
    config.validate()?;

    info!("AnyScreen v{}", env!("CARGO_PKG_VERSION"));
    let service = Arc::new(build_service(&config)?);

    match command {
        Command::Serve => serve(config, service).await,
        Command::Displays { json } => displays(&service, json),
        Command::Snapshot { output } => snapshot(&config, &service, &output).await,
        Command::Record { duration, .. } => {
            let summary = record(&config, &service, duration.map(Duration::from_secs)).await?;
            info!(
                "wrote {} frame(s) in {:.1}s to {}",
                summary.frames_written,
                summary.duration.as_secs_f64(),
                summary.output_path.display()
            );
            Ok(())
        }
    }
}

fn build_service(config: &ServerConfig) -> Result<CaptureService> {
    let span = info_span!("anyscreen");
    let source = open_source(config.source_kind()?, span.clone()).context("opening capture source")?;
    if !source.is_supported() {
        bail!("capture source '{}' is not usable on this machine", config.source);
    }

    let encoder = match &config.ffmpeg {
        Some(path) => FfmpegEncoder::with_binary(path.clone(), span.clone()),
        None => FfmpegEncoder::new(span.clone()),
    };
    Ok(CaptureService::new(source, Arc::new(encoder), span).with_options(config.pipeline_options()))
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn serve(config: ServerConfig, service: Arc<CaptureService>) -> Result<()> {
    let bind = format!("{}:{}", config.stream.host, config.stream.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;

    let span = info_span!("http", bind = %bind);
    let state = Arc::new(http::AppState::new(Arc::clone(&service), config.stream, config.recording, span));
    let shutdown = {
        let service = Arc::clone(&service);
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            if let Err(e) = service.shutdown().await {
                warn!("shutdown: {e}");
            }
        }
    };
    http::serve(listener, state, shutdown).await
}

fn displays(service: &CaptureService, json: bool) -> Result<()> {
    let displays = service.list_displays();
    if json {
        println!("{}", serde_json::to_string_pretty(&displays)?);
        return Ok(());
    }
    if displays.is_empty() {
        println!("No displays found.");
        return Ok(());
    }
    println!("{:<6} {:<20} {:<8} {}", "INDEX", "BOUNDS", "PRIMARY", "DEVICE");
    for d in displays {
        println!(
            "{:<6} {:<20} {:<8} {}",
            d.index,
            d.bounds.to_string(),
            if d.primary { "yes" } else { "" },
            d.device_id
        );
    }
    Ok(())
}

async fn snapshot(config: &ServerConfig, service: &CaptureService, output: &std::path::Path) -> Result<()> {
    let format = StillFormat::from_path(output)
        .ok_or_else(|| anyhow!("{}: use a .png, .jpg or .jpeg file name", output.display()))?;
    let index = config.stream.display_index;
    let frame = service.snapshot(index).await.with_context(|| format!("capturing display {index}"))?;
    let quality = config.stream.quality;
    let image = tokio::task::spawn_blocking(move || format.encode(&frame, quality))
        .await
        .context("encode task")??;
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(output, &image).with_context(|| format!("writing {}", output.display()))?;
    info!("saved display {index} to {} ({} bytes)", output.display(), image.len());
    Ok(())
}

async fn record(
    config: &ServerConfig,
    service: &CaptureService,
    duration: Option<Duration>,
) -> Result<RecordingSummary> {
    service
        .start_recording(config.recording.clone())
        .await
        .context("starting recording")?;
    info!("recording, press Ctrl-C to stop");

    let deadline = async {
        match duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        ended = service.wait_recording() => {
            return match ended {
                Some(outcome) => outcome.context("recording failed"),
                None => Err(anyhow!("recording was never started")),
            };
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = deadline => info!("duration reached"),
    }

    match service.stop_recording().await.context("stopping recording")? {
        Some(summary) => Ok(summary),
        // Ended on its own while we were stopping it.
        None => match service.wait_recording().await {
            Some(outcome) => outcome.context("recording failed"),
            None => Err(anyhow!("recording was never started")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["anyscreen", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.settings.port, Some(9000));
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "anyscreen", "record", "-o", "out.mkv", "-d", "5", "--fps", "24", "--display", "1",
        ])
        .unwrap();
        let Some(Command::Record { output, duration }) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(output, Some(PathBuf::from("out.mkv")));
        assert_eq!(duration, Some(5));

        let o = Overrides::from(cli.settings);
        assert_eq!(o.fps, Some(24));
        assert_eq!(o.display, Some(1));
    }

    #[test]
    fn snapshot_takes_an_output_path() {
        let cli = Cli::try_parse_from(["anyscreen", "snapshot", "--display", "1"]).unwrap();
        let Some(Command::Snapshot { output }) = cli.command else {
            panic!("expected snapshot");
        };
        assert_eq!(output, PathBuf::from("snapshot.png"));
        assert_eq!(cli.settings.display, Some(1));
    }

    #[tokio::test]
    async fn snapshot_writes_an_image_file() {
        let config = ServerConfig::default();
        let service = build_service(&config).unwrap();
        let dir = std::env::temp_dir().join(format!("anyscreen-snapshot-{}", std::process::id()));
        let output = dir.join("shot.jpg");

        snapshot(&config, &service, &output).await.unwrap();
        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert!(snapshot(&config, &service, &dir.join("shot.bmp")).await.is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
