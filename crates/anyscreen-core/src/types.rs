use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// MARK: - Rect

/// A region of the virtual desktop, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        let right = self.x as i64 + self.width as i64;
        let bottom = self.y as i64 + self.height as i64;
        other.x >= self.x
            && other.y >= self.y
            && other.x as i64 + other.width as i64 <= right
            && other.y as i64 + other.height as i64 <= bottom
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

// MARK: - DisplayInfo

/// One enumerated display. Ordering is stable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub index: u32,
    pub bounds: Rect,
    pub primary: bool,
    pub device_id: String,
}

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, unused.
    Bgrx,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba,
    /// 3 bytes per pixel, packed.
    Rgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgrx | Self::Bgra | Self::Rgba => 4,
            Self::Rgb => 3,
        }
    }

    /// Name of the matching ffmpeg `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Bgrx => "bgr0",
            Self::Bgra => "bgra",
            Self::Rgba => "rgba",
            Self::Rgb => "rgb24",
        }
    }
}

// MARK: - Frame

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// One captured screen image.
///
/// Immutable once built: the pixel buffer is a reference-counted [`Bytes`],
/// so cloning a frame to hand it to several sinks never copies pixels and no
/// sink can change what another one sees.
#[derive(Debug, Clone)]
pub struct Frame {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
    captured_at: Instant,
    display_index: u32,
}

impl Frame {
    /// Wrap a raw pixel buffer. Returns `None` when `data` is not exactly
    /// `width × height × bytes_per_pixel` long.
    pub fn from_raw(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
        display_index: u32,
    ) -> Option<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return None;
        }
        Some(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            data,
            captured_at: Instant::now(),
            display_index,
        })
    }

    /// Process-unique identifier, increasing in creation order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn display_index(&self) -> u32 {
        self.display_index
    }

    /// Bytes per pixel row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks_buffer_length() {
        assert!(Frame::from_raw(2, 2, PixelFormat::Bgrx, vec![0u8; 16], 0).is_some());
        assert!(Frame::from_raw(2, 2, PixelFormat::Bgrx, vec![0u8; 15], 0).is_none());
        assert!(Frame::from_raw(2, 2, PixelFormat::Rgb, vec![0u8; 12], 0).is_some());
        assert!(Frame::from_raw(0, 2, PixelFormat::Rgb, Vec::<u8>::new(), 0).is_none());
    }

    #[test]
    fn frame_ids_increase() {
        let a = Frame::from_raw(1, 1, PixelFormat::Rgba, vec![0u8; 4], 0).unwrap();
        let b = Frame::from_raw(1, 1, PixelFormat::Rgba, vec![0u8; 4], 0).unwrap();
        assert!(b.id() > a.id());
        assert!(b.captured_at() >= a.captured_at());
    }

    #[test]
    fn clones_share_pixels() {
        let a = Frame::from_raw(1, 1, PixelFormat::Rgba, vec![1u8, 2, 3, 4], 3).unwrap();
        let b = a.clone();
        assert_eq!(a.data().as_ptr(), b.data().as_ptr());
        assert_eq!(b.display_index(), 3);
        assert_eq!(b.stride(), 4);
    }

    #[test]
    fn rect_containment() {
        let screen = Rect::new(0, 0, 1920, 1080);
        assert!(screen.contains(&Rect::new(10, 10, 100, 100)));
        assert!(screen.contains(&screen));
        assert!(!screen.contains(&Rect::new(1900, 0, 100, 100)));
        assert!(!screen.contains(&Rect::new(-1, 0, 10, 10)));
    }
}
