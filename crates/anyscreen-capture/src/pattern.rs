//! Synthetic source: a scrolling BGRx gradient per display.
//!
//! Useful headless (CI, containers) and as a deterministic stand-in for a
//! real screen when exercising the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use anyscreen_core::{CaptureError, DisplayInfo, Frame, PixelFormat, Rect};
use tracing::{trace, Span};

use crate::FrameSource;

/// Generates frames for a fixed, virtual display layout.
pub struct TestPatternSource {
    displays: Vec<DisplayInfo>,
    phase:    AtomicU64,
    span:     Span,
}

impl TestPatternSource {
    /// A source with the given display layout. Indexes are reassigned in order.
    pub fn new(bounds: impl IntoIterator<Item = Rect>) -> Self {
        let displays = bounds
            .into_iter()
            .enumerate()
            .map(|(i, bounds)| DisplayInfo {
                index: i as u32,
                bounds,
                primary: i == 0,
                device_id: format!("pattern-{i}"),
            })
            .collect();
        Self { displays, phase: AtomicU64::new(0), span: Span::none() }
    }

    /// One primary display at the origin.
    pub fn single(width: u32, height: u32) -> Self {
        Self::new([Rect::new(0, 0, width, height)])
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn render(&self, region: Rect, display_index: u32) -> Result<Frame, CaptureError> {
        if region.is_empty() {
            return Err(CaptureError::Failed { reason: format!("empty region {region}") });
        }
        let phase = self.phase.fetch_add(1, Ordering::Relaxed);
        let (w, h) = (region.width as usize, region.height as usize);
        let mut data = vec![0u8; w * h * 4];

        for (row, line) in data.chunks_exact_mut(w * 4).enumerate() {
            let gy = region.y as i64 + row as i64;
            for (col, px) in line.chunks_exact_mut(4).enumerate() {
                let gx = region.x as i64 + col as i64;
                px[0] = (gx + phase as i64) as u8;
                px[1] = (gy + (phase / 2) as i64) as u8;
                px[2] = (gx ^ gy) as u8;
                px[3] = 0xff;
            }
        }

        trace!(parent: &self.span, "pattern frame phase={} region={}", phase, region);
        Frame::from_raw(region.width, region.height, PixelFormat::Bgrx, data, display_index)
            .ok_or_else(|| CaptureError::Failed { reason: format!("empty region {region}") })
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::single(1280, 720)
    }
}

impl FrameSource for TestPatternSource {
    fn capture(&self, display_index: u32) -> Result<Frame, CaptureError> {
        let display = self.display(display_index)?;
        self.render(display.bounds, display_index)
    }

    fn capture_region(&self, region: Rect) -> Result<Frame, CaptureError> {
        let owner = self
            .displays
            .iter()
            .find(|d| d.bounds.contains(&region))
            .ok_or_else(|| CaptureError::Failed {
                reason: format!("region {region} is not inside a single display"),
            })?;
        self.render(region, owner.index)
    }

    fn enumerate_displays(&self) -> Vec<DisplayInfo> {
        self.displays.clone()
    }

    fn is_supported(&self) -> bool {
        !self.displays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual() -> TestPatternSource {
        TestPatternSource::new([Rect::new(0, 0, 64, 32), Rect::new(64, 0, 32, 16)])
    }

    #[test]
    fn enumerates_in_order_with_first_primary() {
        let displays = dual().enumerate_displays();
        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].index, 0);
        assert!(displays[0].primary);
        assert_eq!(displays[1].bounds, Rect::new(64, 0, 32, 16));
        assert!(!displays[1].primary);
        assert_eq!(displays, dual().enumerate_displays());
    }

    #[test]
    fn captures_display_at_its_size() {
        let frame = dual().capture(1).expect("capture");
        assert_eq!((frame.width(), frame.height()), (32, 16));
        assert_eq!(frame.format(), PixelFormat::Bgrx);
        assert_eq!(frame.display_index(), 1);
        assert_eq!(frame.data().len(), 32 * 16 * 4);
    }

    #[test]
    fn out_of_range_index_is_unavailable() {
        assert_eq!(
            dual().capture(2).unwrap_err(),
            CaptureError::Unavailable { index: 2, available: 2 }
        );
    }

    #[test]
    fn consecutive_frames_differ() {
        let source = TestPatternSource::single(8, 8);
        let a = source.capture(0).unwrap();
        let b = source.capture(0).unwrap();
        assert_ne!(a.data(), b.data());
    }

    #[test]
    fn region_capture() {
        let source = dual();
        let frame = source.capture_region(Rect::new(70, 2, 10, 4)).expect("region");
        assert_eq!((frame.width(), frame.height()), (10, 4));
        assert_eq!(frame.display_index(), 1);
        assert!(source.capture_region(Rect::new(60, 0, 10, 4)).is_err());
    }

    #[test]
    fn empty_region_fails_instead_of_panicking() {
        let source = dual();
        let err = source.capture_region(Rect::new(10, 10, 0, 4)).unwrap_err();
        assert!(matches!(err, CaptureError::Failed { .. }), "{err:?}");
        assert!(source.capture_region(Rect::new(10, 10, 8, 0)).is_err());

        let flat = TestPatternSource::new([Rect::new(0, 0, 0, 0)]);
        assert!(matches!(flat.capture(0), Err(CaptureError::Failed { .. })));
    }

    #[test]
    fn empty_layout_is_unsupported() {
        let source = TestPatternSource::new(Vec::new());
        assert!(!source.is_supported());
        assert!(source.enumerate_displays().is_empty());
    }
}
