//! Device sensing: screenshot, UI hierarchy dump, screen dimensions.

use tracing::warn;

use super::{AdbBridge, DeviceError, DeviceResult};
use crate::ui::Viewport;

const REMOTE_DUMP_PATH: &str = "/data/local/tmp/uidump.xml";

/// Capture the current screen as PNG bytes
pub fn screenshot(bridge: &AdbBridge) -> DeviceResult<Vec<u8>> {
    let bytes = bridge.exec(&["exec-out", "screencap", "-p"])?;
    if bytes.is_empty() {
        return Err(DeviceError::Unreachable(
            "screencap produced no output".to_string(),
        ));
    }
    Ok(bytes)
}

/// Dump the UI hierarchy and read it back
pub fn layout_xml(bridge: &AdbBridge) -> DeviceResult<String> {
    bridge.shell(&["uiautomator", "dump", REMOTE_DUMP_PATH])?;
    let xml = bridge.shell(&["cat", REMOTE_DUMP_PATH])?;
    // Cleanup failure doesn't invalidate the dump we already read.
    let _ = bridge.shell(&["rm", REMOTE_DUMP_PATH]);
    if xml.is_empty() {
        return Err(DeviceError::Unreachable(
            "uiautomator dump produced no output".to_string(),
        ));
    }
    Ok(xml)
}

/// Query the physical screen size, falling back to a common default when the
/// device won't say.
pub fn screen_viewport(bridge: &AdbBridge) -> Viewport {
    match bridge.shell(&["wm", "size"]) {
        Ok(out) => parse_wm_size(&out).unwrap_or_else(|| {
            warn!("could not parse 'wm size' output, using default viewport");
            Viewport::default()
        }),
        Err(e) => {
            warn!(error = %e, "could not query screen size, using default viewport");
            Viewport::default()
        }
    }
}

/// Parse `wm size` output such as `Physical size: 1080x1920`.
///
/// When an override line is present it wins, since that is what the UI is
/// actually rendered at.
fn parse_wm_size(output: &str) -> Option<Viewport> {
    let mut result = None;
    for line in output.lines() {
        let Some((label, dims)) = line.split_once(':') else {
            continue;
        };
        let Some((w, h)) = dims.trim().split_once('x') else {
            continue;
        };
        let (Ok(width), Ok(height)) = (w.trim().parse(), h.trim().parse()) else {
            continue;
        };
        let viewport = Viewport { width, height };
        if label.trim().eq_ignore_ascii_case("Override size") {
            return Some(viewport);
        }
        result = Some(viewport);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wm_size_physical() {
        let v = parse_wm_size("Physical size: 1080x1920").unwrap();
        assert_eq!(v, Viewport { width: 1080, height: 1920 });
    }

    #[test]
    fn test_parse_wm_size_prefers_override() {
        let out = "Physical size: 1440x3040\nOverride size: 1080x2280";
        let v = parse_wm_size(out).unwrap();
        assert_eq!(v, Viewport { width: 1080, height: 2280 });
    }

    #[test]
    fn test_parse_wm_size_rejects_garbage() {
        assert!(parse_wm_size("no size here").is_none());
        assert!(parse_wm_size("Physical size: wide").is_none());
    }
}
