//! X11 screen capture through GStreamer.
//!
//! ```text
//! ximagesrc(startx..endx, starty..endy)
//!       │
//!   videoconvert
//!       │
//! video/x-raw,format=BGRx
//!       │
//!    appsink (max-buffers=1, drop=true) ──► try_pull_sample() per capture()
//! ```
//!
//! One live pipeline is kept per captured rectangle; `capture()` pulls the
//! most recent sample, so the caller's cadence decides the frame rate.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use anyscreen_core::{CaptureError, DisplayInfo, Frame, PixelFormat, Rect};
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use tracing::{debug, info, warn, Span};

use crate::displays::query_monitors;
use crate::FrameSource;

/// Longest wait for a sample before a capture counts as failed.
const PULL_TIMEOUT_MS: u64 = 500;

struct RegionPipeline {
    pipeline: gstreamer::Pipeline,
    appsink:  AppSink,
}

impl Drop for RegionPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Captures X11 monitors enumerated by xrandr.
pub struct X11ScreenSource {
    displays:  Vec<DisplayInfo>,
    pipelines: Mutex<HashMap<Rect, RegionPipeline>>,
    span:      Span,
}

impl X11ScreenSource {
    pub fn new(span: Span) -> anyhow::Result<Self> {
        gstreamer::init().context("GStreamer init")?;
        if gstreamer::ElementFactory::find("ximagesrc").is_none() {
            anyhow::bail!("GStreamer element 'ximagesrc' not found (install gst-plugins-good)");
        }
        let displays = query_monitors(&span)?;
        info!(parent: &span, "X11 capture ready: {} monitor(s)", displays.len());
        Ok(Self { displays, pipelines: Mutex::new(HashMap::new()), span })
    }

    fn open_region(&self, region: Rect) -> anyhow::Result<RegionPipeline> {
        // ximagesrc end coordinates are inclusive.
        let endx = region.x as i64 + region.width as i64 - 1;
        let endy = region.y as i64 + region.height as i64 - 1;
        let desc = format!(
            "ximagesrc startx={} starty={} endx={endx} endy={endy} use-damage=false show-pointer=true \
             ! videoconvert \
             ! video/x-raw,format=BGRx \
             ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false",
            region.x, region.y,
        );
        debug!(parent: &self.span, "Capture pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .context("Parsing capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Expected a Pipeline"))?;

        let appsink: AppSink = pipeline
            .by_name("sink")
            .context("Finding appsink 'sink'")?
            .downcast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("Starting capture pipeline")?;

        Ok(RegionPipeline { pipeline, appsink })
    }

    fn pull(&self, region: Rect, display_index: u32) -> Result<Frame, CaptureError> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        if !pipelines.contains_key(&region) {
            let opened = self.open_region(region)
                .map_err(|e| CaptureError::Failed { reason: format!("{e:#}") })?;
            pipelines.insert(region, opened);
        }
        let Some(entry) = pipelines.get(&region) else {
            return Err(CaptureError::Failed { reason: "capture pipeline missing".into() });
        };

        let sample = entry
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT_MS));
        let Some(sample) = sample else {
            if entry.appsink.is_eos() {
                warn!(parent: &self.span, "Capture pipeline for {} reached EOS, reopening next time", region);
                pipelines.remove(&region);
            }
            return Err(CaptureError::Failed { reason: "no sample within timeout".into() });
        };

        sample_to_frame(&sample, display_index)
    }
}

fn sample_to_frame(sample: &gstreamer::Sample, display_index: u32) -> Result<Frame, CaptureError> {
    let failed = |reason: &str| CaptureError::Failed { reason: reason.to_owned() };

    let caps = sample.caps().ok_or_else(|| failed("sample without caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).map_err(|_| failed("unreadable caps"))?;
    let buffer = sample.buffer().ok_or_else(|| failed("sample without buffer"))?;
    let map = buffer.map_readable().map_err(|_| failed("buffer not readable"))?;

    let (width, height) = (info.width(), info.height());
    let row_bytes = width as usize * 4;
    let stride = info.stride()[0] as usize;
    let src = map.as_slice();

    let mut data = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = src
            .get(start..start + row_bytes)
            .ok_or_else(|| failed("short buffer"))?;
        data.extend_from_slice(line);
    }

    Frame::from_raw(width, height, PixelFormat::Bgrx, data, display_index)
        .ok_or_else(|| failed("frame size mismatch"))
}

impl FrameSource for X11ScreenSource {
    fn capture(&self, display_index: u32) -> Result<Frame, CaptureError> {
        let display = self.display(display_index)?;
        self.pull(display.bounds, display_index)
    }

    fn capture_region(&self, region: Rect) -> Result<Frame, CaptureError> {
        if region.is_empty() {
            return Err(CaptureError::Failed { reason: format!("empty region {region}") });
        }
        let owner = self
            .displays
            .iter()
            .find(|d| d.bounds.contains(&region))
            .map(|d| d.index)
            .unwrap_or(0);
        self.pull(region, owner)
    }

    fn enumerate_displays(&self) -> Vec<DisplayInfo> {
        self.displays.clone()
    }

    fn is_supported(&self) -> bool {
        std::env::var_os("DISPLAY").is_some() && !self.displays.is_empty()
    }
}
