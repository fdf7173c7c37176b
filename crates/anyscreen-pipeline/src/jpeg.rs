//! Still-image encoding for MJPEG parts and one-off snapshots.
//!
//! Pixel conversion and JPEG output reuse per-thread scratch buffers, so a
//! blocking-pool thread that encodes frame after frame stops allocating once
//! the buffers have grown to the frame size. The shared [`Frame`] is only
//! ever read.

use std::cell::RefCell;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyscreen_core::{EncoderError, Frame, PixelFormat};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Rgb};
use tracing::{trace, Span};

thread_local! {
    static RGB_SCRATCH:  RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    static JPEG_SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// `encodeJPEG(frame, quality) -> bytes`.
pub trait StillEncoder: Send + Sync {
    fn encode(&self, frame: &Frame, quality: u8) -> Result<Bytes, EncoderError>;
}

/// JPEG via the `image` crate. Frames larger than the bounding box are
/// downscaled, preserving aspect ratio.
#[derive(Debug, Clone)]
pub struct ImageJpegEncoder {
    max_width:  u32,
    max_height: u32,
    span:       Span,
}

impl ImageJpegEncoder {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self { max_width, max_height, span: Span::none() }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Never scales.
    pub fn native() -> Self {
        Self::new(u32::MAX, u32::MAX)
    }
}

impl Default for ImageJpegEncoder {
    fn default() -> Self {
        Self::native()
    }
}

impl StillEncoder for ImageJpegEncoder {
    fn encode(&self, frame: &Frame, quality: u8) -> Result<Bytes, EncoderError> {
        RGB_SCRATCH.with(|rgb| {
            JPEG_SCRATCH.with(|out| {
                let mut rgb = rgb.borrow_mut();
                let mut out = out.borrow_mut();
                to_rgb(frame, &mut rgb);

                let (w, h) = (frame.width(), frame.height());
                let (sw, sh) = fit_within(w, h, self.max_width, self.max_height);
                out.clear();
                if (sw, sh) == (w, h) {
                    write_jpeg(&rgb, w, h, quality, &mut out)?;
                } else {
                    let full = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(w, h, &rgb[..])
                        .ok_or_else(|| failed("RGB buffer size mismatch"))?;
                    let scaled = image::imageops::resize(&full, sw, sh, FilterType::Triangle);
                    write_jpeg(scaled.as_raw(), sw, sh, quality, &mut out)?;
                }

                trace!(parent: &self.span, "frame {} → {} byte JPEG ({}x{} q{})", frame.id(), out.len(), sw, sh, quality);
                Ok(Bytes::copy_from_slice(&out))
            })
        })
    }
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// Encodings offered for a single captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StillFormat {
    #[default]
    Jpeg,
    Png,
}

impl StillFormat {
    /// Format implied by a file name, if any.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()?.to_str()?.parse().ok()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Encode `frame` at native size. `quality` only applies to JPEG.
    pub fn encode(self, frame: &Frame, quality: u8) -> Result<Bytes, EncoderError> {
        match self {
            Self::Jpeg => ImageJpegEncoder::native().encode(frame, quality),
            Self::Png => {
                let mut rgb = Vec::new();
                to_rgb(frame, &mut rgb);
                let mut out = Vec::new();
                PngEncoder::new(&mut out)
                    .write_image(&rgb, frame.width(), frame.height(), ExtendedColorType::Rgb8)
                    .map_err(|e| failed(&e.to_string()))?;
                Ok(Bytes::from(out))
            }
        }
    }
}

impl FromStr for StillFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(format!("unsupported image format '{other}'")),
        }
    }
}

fn write_jpeg(rgb: &[u8], w: u32, h: u32, quality: u8, out: &mut Vec<u8>) -> Result<(), EncoderError> {
    JpegEncoder::new_with_quality(out, quality.clamp(1, 100))
        .encode(rgb, w, h, ExtendedColorType::Rgb8)
        .map_err(|e| failed(&e.to_string()))
}

fn failed(reason: &str) -> EncoderError {
    EncoderError::EncodingFailed { reason: reason.to_owned() }
}

/// Packed RGB24 copy of `frame` into `out`.
fn to_rgb(frame: &Frame, out: &mut Vec<u8>) {
    let src = frame.data();
    out.clear();
    out.reserve(frame.width() as usize * frame.height() as usize * 3);
    match frame.format() {
        PixelFormat::Bgrx | PixelFormat::Bgra => {
            for px in src.chunks_exact(4) {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        PixelFormat::Rgba => {
            for px in src.chunks_exact(4) {
                out.extend_from_slice(&px[..3]);
            }
        }
        PixelFormat::Rgb => out.extend_from_slice(src),
    }
}

/// Largest size within `max_w × max_h` with the aspect ratio of `w × h`.
/// Never upscales.
fn fit_within(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let sw = ((w as f64) * scale).round() as u32;
    let sh = ((h as f64) * scale).round() as u32;
    (sw.max(1), sh.max(1))
}

// ── Per-frame cache ───────────────────────────────────────────────────────────

/// Encodes each frame at most once for every client of a stream.
///
/// Deliveries within a broadcast are sequential, so the first client to see
/// a frame pays for the encode and the rest reuse the result.
pub struct SharedJpeg {
    encoder: Arc<dyn StillEncoder>,
    quality: u8,
    last:    tokio::sync::Mutex<Option<(u64, Bytes)>>,
}

impl SharedJpeg {
    pub fn new(encoder: Arc<dyn StillEncoder>, quality: u8) -> Self {
        Self { encoder, quality, last: tokio::sync::Mutex::new(None) }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// JPEG bytes for `frame`, encoded off the async runtime on first use.
    pub async fn get(&self, frame: &Frame) -> Result<Bytes, EncoderError> {
        let mut last = self.last.lock().await;
        if let Some((id, jpeg)) = last.as_ref() {
            if *id == frame.id() {
                return Ok(jpeg.clone());
            }
        }

        let encoder = Arc::clone(&self.encoder);
        let owned = frame.clone();
        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || encoder.encode(&owned, quality))
            .await
            .map_err(|e| failed(&format!("encode task: {e}")))??;

        *last = Some((frame.id(), jpeg.clone()));
        Ok(jpeg)
    }
}
