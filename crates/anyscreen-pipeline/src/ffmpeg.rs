//! Video encoding by piping raw frames into an `ffmpeg` child process.
//!
//! ```text
//! Frame bytes ──stdin──► ffmpeg -f rawvideo -pix_fmt <fmt> -s WxH -r fps -i -
//!                               -c:v <codec> -b:v <rate> -vf scale=W:H ... <output>
//! ```
//!
//! The process is spawned on the first frame, once the capture size and pixel
//! layout are known; the configured width and height are the output size.
//! Frames larger than the first one are cropped to it, smaller ones are
//! rejected.
//!
//! The child lives behind its own lock, apart from stdin, so it can be
//! killed while a write is blocked on a full pipe.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyscreen_core::{EncoderError, Frame, PixelFormat, RecordingConfig, VideoCodec};
use ffmpeg_sidecar::command::FfmpegCommand;
use tracing::{debug, info, Span};

use crate::recording::{EncodeHandle, EncoderAbort, VideoEncoder};

/// How often `close` checks whether ffmpeg has exited.
const EXIT_POLL: Duration = Duration::from_millis(10);

fn default_binary() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("ffmpeg")
    }
    #[cfg(not(target_os = "linux"))]
    {
        ffmpeg_sidecar::paths::ffmpeg_path()
    }
}

pub struct FfmpegEncoder {
    binary: PathBuf,
    span:   Span,
}

impl FfmpegEncoder {
    /// System `ffmpeg` on Linux, the binary next to the executable elsewhere.
    pub fn new(span: Span) -> Self {
        Self::with_binary(default_binary(), span)
    }

    pub fn with_binary(binary: impl Into<PathBuf>, span: Span) -> Self {
        Self { binary: binary.into(), span }
    }

    fn probe(&self) -> Result<(), EncoderError> {
        let output = Command::new(&self.binary)
            .args(["-version", "-hide_banner"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EncoderError::Open { reason: format!("{}: {e}", self.binary.display()) })?;
        if !output.status.success() {
            return Err(EncoderError::Open {
                reason: format!("{} -version exited with {}", self.binary.display(), output.status),
            });
        }
        if let Some(version) = String::from_utf8_lossy(&output.stdout).lines().next() {
            debug!(parent: &self.span, "{}", version);
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn open(&self, config: &RecordingConfig) -> Result<Box<dyn EncodeHandle>, EncoderError> {
        self.probe()?;
        if let Some(dir) = config.output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| EncoderError::Open { reason: format!("{}: {e}", dir.display()) })?;
        }
        Ok(Box::new(FfmpegHandle::new(self.binary.clone(), config.clone(), self.span.clone())))
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

type SharedChild = Arc<Mutex<Option<Child>>>;

struct Process {
    stdin:  Option<ChildStdin>,
    width:  u32,
    height: u32,
    format: PixelFormat,
    stderr: Option<JoinHandle<Option<String>>>,
}

struct FfmpegHandle {
    binary:  PathBuf,
    config:  RecordingConfig,
    span:    Span,
    child:   SharedChild,
    process: Option<Process>,
}

impl FfmpegHandle {
    fn new(binary: PathBuf, config: RecordingConfig, span: Span) -> Self {
        Self { binary, config, span, child: Arc::new(Mutex::new(None)), process: None }
    }

    fn spawn(&self, frame: &Frame) -> Result<Process, EncoderError> {
        let open_err = |reason: String| EncoderError::Open { reason };

        let mut command = FfmpegCommand::new_with_path(&self.binary);
        command.args(encoder_args(&self.config, frame.width(), frame.height(), frame.format()));

        let inner = command.as_inner_mut();
        inner.stdin(Stdio::piped());
        inner.stdout(Stdio::null());
        inner.stderr(Stdio::piped());

        let mut child = inner.spawn().map_err(|e| open_err(format!("spawning ffmpeg: {e}")))?;
        let stdin = child.stdin.take().ok_or_else(|| open_err("ffmpeg stdin unavailable".into()))?;

        let stderr = child.stderr.take().map(|stderr| {
            let span = self.span.clone();
            std::thread::spawn(move || {
                let mut last = None;
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!(parent: &span, "[ffmpeg] {}", line);
                    last = Some(line);
                }
                last
            })
        });

        info!(
            parent: &self.span,
            "ffmpeg encoding {}x{} {:?} → {}",
            frame.width(),
            frame.height(),
            self.config.codec,
            self.config.output_path.display()
        );
        *lock(&self.child) = Some(child);
        Ok(Process {
            stdin: Some(stdin),
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
            stderr,
        })
    }
}

impl EncodeHandle for FfmpegHandle {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if self.process.is_none() {
            self.process = Some(self.spawn(frame)?);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(EncoderError::NotConfigured);
        };
        let failed = |e: std::io::Error| EncoderError::EncodingFailed { reason: format!("ffmpeg stdin: {e}") };

        if frame.width() < process.width || frame.height() < process.height {
            return Err(EncoderError::FrameMismatch {
                width: process.width,
                height: process.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }
        if frame.format() != process.format {
            return Err(EncoderError::EncodingFailed {
                reason: format!("pixel format changed from {:?} to {:?}", process.format, frame.format()),
            });
        }
        let Some(stdin) = process.stdin.as_mut() else {
            return Err(EncoderError::EncodingFailed { reason: "ffmpeg stdin closed".into() });
        };

        if frame.width() == process.width && frame.height() == process.height {
            stdin.write_all(frame.data()).map_err(failed)?;
        } else {
            let bpp = frame.format().bytes_per_pixel();
            let row = process.width as usize * bpp;
            for line in frame.data().chunks_exact(frame.stride()).take(process.height as usize) {
                stdin.write_all(&line[..row]).map_err(failed)?;
            }
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), EncoderError> {
        let Some(mut process) = self.process.take() else {
            debug!(parent: &self.span, "ffmpeg never started, nothing to finalise");
            return Ok(());
        };

        // EOF on stdin lets ffmpeg flush and write the container trailer.
        drop(process.stdin.take());
        let status = wait_for_exit(&self.child)?;
        let last_line = process.stderr.take().and_then(|t| t.join().ok()).flatten();

        if status.success() {
            info!(parent: &self.span, "ffmpeg wrote {}", self.config.output_path.display());
            Ok(())
        } else {
            Err(EncoderError::Close {
                reason: match last_line {
                    Some(line) => format!("ffmpeg exited with {status}: {line}"),
                    None => format!("ffmpeg exited with {status}"),
                },
            })
        }
    }

    fn abort_handle(&self) -> Option<Arc<dyn EncoderAbort>> {
        Some(Arc::new(KillOnAbort(Arc::clone(&self.child))))
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        // Dropped without close(): don't leave ffmpeg waiting on stdin.
        if let Some(mut process) = self.process.take() {
            drop(process.stdin.take());
            if let Some(child) = lock(&self.child).as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Kills the ffmpeg child, which fails any write blocked on its stdin.
struct KillOnAbort(SharedChild);

impl EncoderAbort for KillOnAbort {
    fn abort(&self) {
        if let Some(child) = lock(&self.0).as_mut() {
            let _ = child.kill();
        }
    }
}

/// Poll for exit without holding the child lock, so an abort can still
/// reach the process.
fn wait_for_exit(child: &SharedChild) -> Result<ExitStatus, EncoderError> {
    let closed = |reason: String| EncoderError::Close { reason };
    loop {
        {
            let mut guard = lock(child);
            let Some(process) = guard.as_mut() else {
                return Err(closed("ffmpeg process missing".into()));
            };
            if let Some(status) = process.try_wait().map_err(|e| closed(format!("waiting for ffmpeg: {e}")))? {
                return Ok(status);
            }
        }
        std::thread::sleep(EXIT_POLL);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Arguments ─────────────────────────────────────────────────────────────────

/// ffmpeg arguments for raw frames of `width × height` in `format`.
fn encoder_args(config: &RecordingConfig, width: u32, height: u32, format: PixelFormat) -> Vec<String> {
    // Most codecs need even output dimensions.
    let (out_w, out_h) = ((config.width & !1).max(2), (config.height & !1).max(2));
    let out_pix = match config.codec {
        VideoCodec::Mjpeg => "yuvj420p",
        _ => "yuv420p",
    };
    let container = match config.format.as_str() {
        "mkv" => "matroska",
        other => other,
    };

    let mut args: Vec<String> = [
        "-hide_banner", "-loglevel", "error",
        "-f", "rawvideo",
        "-pix_fmt", format.ffmpeg_name(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend([
        "-s".into(), format!("{width}x{height}"),
        "-r".into(), config.frame_rate.to_string(),
        "-i".into(), "-".into(),
        "-c:v".into(), config.codec.ffmpeg_encoder().into(),
        "-b:v".into(), config.bit_rate.to_string(),
        "-vf".into(), format!("scale={out_w}:{out_h}"),
        "-pix_fmt".into(), out_pix.into(),
    ]);
    if config.codec == VideoCodec::H264 {
        args.extend(["-preset".into(), "ultrafast".into()]);
    }
    if container == "mp4" || container == "mov" {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.extend([
        "-f".into(), container.into(),
        "-y".into(), config.output_path.to_string_lossy().into_owned(),
    ]);
    args
}
