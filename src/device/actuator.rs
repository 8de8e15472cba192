//! Action dispatch: turning validated [`Action`]s into input commands.
//!
//! Element-addressed actions resolve the element's center from the step's
//! observation; an index the observation doesn't contain is rejected, never
//! coerced to some nearby coordinate. Swipes come in two shapes: an element
//! swipe starts at the element center and travels half the screen height
//! upward (a scroll within that element's container), a direction swipe is a
//! half-screen gesture through the screen center.

use std::thread;
use std::time::Duration;
use tracing::info;

use super::{AdbBridge, DeviceError, DeviceResult};
use crate::action::{Action, SwipeDirection, SwipeTarget};
use crate::ui::{Element, Viewport, find_element};

const KEYCODE_HOME: &str = "3";
const KEYCODE_BACK: &str = "4";
const KEYCODE_SPACE: &str = "62";
const KEYCODE_ENTER: &str = "66";

/// Pause after a focusing tap so the keyboard can come up
const FOCUS_DELAY: Duration = Duration::from_millis(500);

/// Gesture duration passed to `input swipe`
const SWIPE_DURATION_MS: &str = "400";

/// Carry out one action against the device
pub fn dispatch(
    bridge: &AdbBridge,
    viewport: Viewport,
    action: &Action,
    elements: &[Element],
) -> DeviceResult<()> {
    info!(device = bridge.serial(), %action, "dispatching");
    match action {
        Action::Tap { index } => {
            let (x, y) = element_center(*index, elements)?;
            tap(bridge, x, y)
        }
        Action::Swipe { target } => swipe(bridge, viewport, *target, elements),
        Action::TypeText { index, text } => {
            let (x, y) = element_center(*index, elements)?;
            tap(bridge, x, y)?;
            thread::sleep(FOCUS_DELAY);
            send_text(bridge, text)
        }
        Action::Back => key_event(bridge, KEYCODE_BACK),
        Action::Home => key_event(bridge, KEYCODE_HOME),
        Action::Wait { seconds } => {
            thread::sleep(Duration::from_secs_f64(*seconds));
            Ok(())
        }
        Action::Finish { .. } => Err(DeviceError::Rejected(
            "finish is a loop-terminal action, not a device input".to_string(),
        )),
    }
}

fn element_center(index: u32, elements: &[Element]) -> DeviceResult<(i32, i32)> {
    match find_element(elements, index) {
        Some(el) => Ok(el.bounds.center()),
        None => Err(DeviceError::Rejected(format!(
            "element index {} is not part of the current observation",
            index
        ))),
    }
}

fn tap(bridge: &AdbBridge, x: i32, y: i32) -> DeviceResult<()> {
    bridge
        .shell(&["input", "tap", &x.to_string(), &y.to_string()])
        .map(|_| ())
}

fn key_event(bridge: &AdbBridge, code: &str) -> DeviceResult<()> {
    bridge.shell(&["input", "keyevent", code]).map(|_| ())
}

fn swipe(
    bridge: &AdbBridge,
    viewport: Viewport,
    target: SwipeTarget,
    elements: &[Element],
) -> DeviceResult<()> {
    let ((x1, y1), (x2, y2)) = match target {
        SwipeTarget::Element(index) => {
            let (x, y) = element_center(index, elements)?;
            let travel = viewport.height / 2;
            ((x, y), (x, (y - travel).max(0)))
        }
        SwipeTarget::Direction(direction) => direction_gesture(viewport, direction),
    };
    bridge
        .shell(&[
            "input",
            "swipe",
            &x1.to_string(),
            &y1.to_string(),
            &x2.to_string(),
            &y2.to_string(),
            SWIPE_DURATION_MS,
        ])
        .map(|_| ())
}

/// Half-screen gesture through the screen center. The direction names the
/// finger's travel: `up` drags content upward, revealing what is below.
fn direction_gesture(viewport: Viewport, direction: SwipeDirection) -> ((i32, i32), (i32, i32)) {
    let cx = viewport.width / 2;
    let cy = viewport.height / 2;
    let dy = viewport.height / 4;
    let dx = viewport.width / 4;
    match direction {
        SwipeDirection::Up => ((cx, cy + dy), (cx, cy - dy)),
        SwipeDirection::Down => ((cx, cy - dy), (cx, cy + dy)),
        SwipeDirection::Left => ((cx + dx, cy), (cx - dx, cy)),
        SwipeDirection::Right => ((cx - dx, cy), (cx + dx, cy)),
    }
}

/// Type text one segment at a time.
///
/// Plain alphanumeric runs go through `input text`; space and newline use key
/// events, everything else goes through the ADBKeyBoard broadcast, the only
/// route that reliably carries non-ASCII input. Requires ADBKeyBoard on the
/// device for that last class of characters.
fn send_text(bridge: &AdbBridge, text: &str) -> DeviceResult<()> {
    let mut run = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            run.push(c);
            continue;
        }
        flush_run(bridge, &mut run)?;
        match c {
            ' ' => key_event(bridge, KEYCODE_SPACE)?,
            '\n' => key_event(bridge, KEYCODE_ENTER)?,
            other => {
                let msg = other.to_string();
                bridge
                    .shell(&["am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", &msg])
                    .map(|_| ())?;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    flush_run(bridge, &mut run)
}

fn flush_run(bridge: &AdbBridge, run: &mut String) -> DeviceResult<()> {
    if run.is_empty() {
        return Ok(());
    }
    let segment = std::mem::take(run);
    bridge.shell(&["input", "text", &segment]).map(|_| ())
}
