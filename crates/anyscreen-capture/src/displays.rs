//! X11 monitor enumeration via `xrandr --listmonitors`.
//!
//! ```text
//! Monitors: 2
//!  0: +*eDP-1 1920/344x1080/194+0+0  eDP-1
//!  1: +HDMI-1 2560/597x1440/336+1920+0  HDMI-1
//! ```
//!
//! `*` marks the primary monitor. Output order is xrandr's, which is stable
//! for a running X server.

use std::process::Command;

use anyhow::Context;
use anyscreen_core::{DisplayInfo, Rect};
use tracing::{debug, Span};

/// Run `xrandr --listmonitors` and parse its output.
pub fn query_monitors(span: &Span) -> anyhow::Result<Vec<DisplayInfo>> {
    let output = Command::new("xrandr")
        .arg("--listmonitors")
        .output()
        .context("Running xrandr --listmonitors")?;
    if !output.status.success() {
        anyhow::bail!(
            "xrandr exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let monitors = parse_monitors(&text);
    debug!(parent: span, "xrandr reported {} monitor(s)", monitors.len());
    Ok(monitors)
}

/// Parse `xrandr --listmonitors` output. Malformed lines are skipped.
pub fn parse_monitors(text: &str) -> Vec<DisplayInfo> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<DisplayInfo> {
    let (index, rest) = line.trim().split_once(':')?;
    let index: u32 = index.trim().parse().ok()?;

    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?;
    let geometry = tokens.next()?;
    let device_id = tokens.last().unwrap_or(name.trim_start_matches(['+', '*']));

    let flags = &name[..name.len() - name.trim_start_matches(['+', '*']).len()];
    let primary = flags.contains('*');

    Some(DisplayInfo {
        index,
        bounds: parse_geometry(geometry)?,
        primary,
        device_id: device_id.to_owned(),
    })
}

/// `1920/344x1080/194+0+0` → `Rect { 0, 0, 1920, 1080 }`.
fn parse_geometry(token: &str) -> Option<Rect> {
    let (size, offsets) = token.split_once('+')?;
    let (x, y) = offsets.split_once('+')?;
    let (w, h) = size.split_once('x')?;
    let width = w.split('/').next()?.parse().ok()?;
    let height = h.split('/').next()?.parse().ok()?;
    Some(Rect::new(x.parse().ok()?, y.parse().ok()?, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUAL: &str = "Monitors: 2\n \
        0: +*eDP-1 1920/344x1080/194+0+0  eDP-1\n \
        1: +HDMI-1 2560/597x1440/336+1920+0  HDMI-1\n";

    #[test]
    fn parses_dual_head_layout() {
        let monitors = parse_monitors(DUAL);
        assert_eq!(monitors.len(), 2);

        assert_eq!(monitors[0].index, 0);
        assert!(monitors[0].primary);
        assert_eq!(monitors[0].bounds, Rect::new(0, 0, 1920, 1080));
        assert_eq!(monitors[0].device_id, "eDP-1");

        assert_eq!(monitors[1].index, 1);
        assert!(!monitors[1].primary);
        assert_eq!(monitors[1].bounds, Rect::new(1920, 0, 2560, 1440));
        assert_eq!(monitors[1].device_id, "HDMI-1");
    }

    #[test]
    fn skips_garbage_lines() {
        let text = "Monitors: 1\n 0: +*VIRTUAL1 not-a-geometry VIRTUAL1\n 1: +DP-2 800/1x600/1+0+0 DP-2\n";
        let monitors = parse_monitors(text);
        assert_eq!(monitors.len(), 1);
        assert_eq!(monitors[0].index, 1);
        assert_eq!(monitors[0].bounds, Rect::new(0, 0, 800, 600));
    }

    #[test]
    fn device_id_falls_back_to_name() {
        let monitors = parse_monitors(" 0: +*XWAYLAND0 1024/0x768/0+0+0\n");
        assert_eq!(monitors[0].device_id, "XWAYLAND0");
    }
}
