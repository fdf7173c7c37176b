//! anyscreen-capture: screen pixel sources for the AnyScreen capture pipeline.
//!
//! # Sources
//!
//! | Source | Backend | Availability |
//! |--------|---------|--------------|
//! | [`TestPatternSource`] | synthetic moving gradient | always |
//! | `X11ScreenSource` | GStreamer `ximagesrc` → appsink | `gstreamer` feature |
//!
//! # Usage
//!
//! ```rust
//! use anyscreen_capture::{FrameSource, TestPatternSource};
//! let source = TestPatternSource::single(320, 240);
//! assert!(source.is_supported());
//! let frame = source.capture(0).unwrap();
//! assert_eq!(frame.width(), 320);
//! ```
//!
//! A source does no scheduling of its own: every [`FrameSource::capture`] call
//! produces exactly one frame, or fails. Callers drive the cadence.

pub mod displays;
mod pattern;
#[cfg(feature = "gstreamer")]
mod x11;

pub use anyscreen_core::{CaptureError, DisplayInfo, Frame, PixelFormat, Rect};
pub use pattern::TestPatternSource;
#[cfg(feature = "gstreamer")]
pub use x11::X11ScreenSource;

// ── FrameSource ──────────────────────────────────────────────────────────────

/// The platform capture primitive.
///
/// Calls may block (an OS screen read); async callers run them on the
/// blocking pool.
pub trait FrameSource: Send + Sync {
    /// Capture the full contents of display `display_index`.
    ///
    /// Fails with [`CaptureError::Unavailable`] when the index is not among
    /// [`enumerate_displays`](Self::enumerate_displays), or
    /// [`CaptureError::Failed`] on a transient OS error.
    fn capture(&self, display_index: u32) -> Result<Frame, CaptureError>;

    /// Capture an arbitrary region of the virtual desktop.
    fn capture_region(&self, region: Rect) -> Result<Frame, CaptureError>;

    /// Displays in a stable order.
    fn enumerate_displays(&self) -> Vec<DisplayInfo>;

    /// Whether capture can work at all here (false when headless).
    fn is_supported(&self) -> bool;

    /// Look up one display by index.
    fn display(&self, display_index: u32) -> Result<DisplayInfo, CaptureError> {
        let displays = self.enumerate_displays();
        let available = displays.len();
        displays
            .into_iter()
            .find(|d| d.index == display_index)
            .ok_or(CaptureError::Unavailable { index: display_index, available })
    }
}

/// Which concrete source a binary should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    TestPattern,
    #[cfg(feature = "gstreamer")]
    X11,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" | "test-pattern" | "pattern" => Ok(Self::TestPattern),
            #[cfg(feature = "gstreamer")]
            "x11" | "ximage" => Ok(Self::X11),
            other => Err(format!("unknown capture source '{other}'")),
        }
    }
}

/// Build the requested source, logging under `span`.
pub fn open_source(kind: SourceKind, span: tracing::Span) -> anyhow::Result<std::sync::Arc<dyn FrameSource>> {
    match kind {
        SourceKind::TestPattern => Ok(std::sync::Arc::new(TestPatternSource::default().with_span(span))),
        #[cfg(feature = "gstreamer")]
        SourceKind::X11 => Ok(std::sync::Arc::new(X11ScreenSource::new(span)?)),
    }
}
