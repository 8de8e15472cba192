//! Typed actions and the model-response contract.
//!
//! The model must answer with a single JSON object:
//!
//! ```json
//! {"thought": "...", "action": "tap", "action_args": {"index": 3}}
//! ```
//!
//! This module decodes that wire shape into a tagged [`Action`] variant and
//! classifies everything that can go wrong into three retryable failure
//! kinds: structural (not JSON even after repair), schema (JSON but not the
//! contract), and reference (an element index that is not on screen).
//! Reference checks run against the step's observation before any action is
//! dispatched.

use serde::{Deserialize, Serialize};

use crate::repair;
use crate::ui::Element;

/// Result type for response parsing
pub type ParseResult<T> = Result<T, ParseFailure>;

/// Classified reasons a model response cannot be acted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// Not valid JSON, and repair (if enabled) could not fix it
    Structural(String),
    /// Valid JSON but missing fields, unknown action name, or bad arguments
    Schema(String),
    /// The action references an element index absent from the observation
    Reference(String),
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseFailure::Structural(msg) => write!(f, "structural parse error: {}", msg),
            ParseFailure::Schema(msg) => write!(f, "schema error: {}", msg),
            ParseFailure::Reference(msg) => write!(f, "reference error: {}", msg),
        }
    }
}

impl std::error::Error for ParseFailure {}

/// Raw wire shape of a model response
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DecisionWire {
    pub thought: String,
    pub action: String,
    #[serde(default)]
    pub action_args: serde_json::Value,
}

/// Swipe gestures aimed by screen direction
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Target of a swipe: a listed element or a screen direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeTarget {
    Element(u32),
    Direction(SwipeDirection),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct TapArgs {
    index: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct SwipeArgs {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    direction: Option<SwipeDirection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct TypeTextArgs {
    index: u32,
    text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct WaitArgs {
    #[serde(default)]
    seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct FinishArgs {
    result: String,
}

/// Default pause for `wait` without arguments (seconds)
const DEFAULT_WAIT_SECS: f64 = 1.0;

fn clamp_wait_secs(secs: f64) -> f64 {
    secs.clamp(0.1, 30.0)
}

/// One atomic device operation chosen by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Tap the center of the element with the given index
    Tap { index: u32 },
    /// Swipe from an element or across the screen in a direction
    Swipe { target: SwipeTarget },
    /// Focus the element and type the text
    TypeText { index: u32, text: String },
    /// Press the system back button
    Back,
    /// Press the system home button
    Home,
    /// Pause before the next observation
    Wait { seconds: f64 },
    /// Declare the task complete with the model's result summary
    Finish { result: String },
}

impl Action {
    /// The element index this action references, if any
    pub fn referenced_index(&self) -> Option<u32> {
        match self {
            Action::Tap { index } => Some(*index),
            Action::TypeText { index, .. } => Some(*index),
            Action::Swipe {
                target: SwipeTarget::Element(index),
            } => Some(*index),
            _ => None,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Tap { index } => write!(f, "tap({})", index),
            Action::Swipe {
                target: SwipeTarget::Element(index),
            } => write!(f, "swipe(element {})", index),
            Action::Swipe {
                target: SwipeTarget::Direction(d),
            } => {
                let name = match d {
                    SwipeDirection::Up => "up",
                    SwipeDirection::Down => "down",
                    SwipeDirection::Left => "left",
                    SwipeDirection::Right => "right",
                };
                write!(f, "swipe({})", name)
            }
            Action::TypeText { index, text } => write!(f, "type_text({}, \"{}\")", index, text),
            Action::Back => write!(f, "back()"),
            Action::Home => write!(f, "home()"),
            Action::Wait { seconds } => write!(f, "wait({}s)", seconds),
            Action::Finish { result } => write!(f, "finish(\"{}\")", result),
        }
    }
}

/// A validated model decision: reasoning plus the chosen action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub thought: String,
    pub action: Action,
}

fn parse_args<T: for<'de> Deserialize<'de>>(
    val: serde_json::Value,
    action_name: &'static str,
) -> ParseResult<T> {
    // An omitted action_args reads as an empty argument object.
    let val = if val.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        val
    };
    serde_json::from_value::<T>(val)
        .map_err(|e| ParseFailure::Schema(format!("{}: {}", action_name, e)))
}

impl TryFrom<DecisionWire> for Action {
    type Error = ParseFailure;

    fn try_from(wire: DecisionWire) -> ParseResult<Self> {
        let name = wire.action.trim().to_ascii_lowercase();
        match name.as_str() {
            "tap" => {
                let args = parse_args::<TapArgs>(wire.action_args, "tap")?;
                Ok(Action::Tap { index: args.index })
            }
            "swipe" => {
                let args = parse_args::<SwipeArgs>(wire.action_args, "swipe")?;
                let target = match (args.index, args.direction) {
                    (Some(index), None) => SwipeTarget::Element(index),
                    (None, Some(direction)) => SwipeTarget::Direction(direction),
                    _ => {
                        return Err(ParseFailure::Schema(
                            "swipe: exactly one of 'index' or 'direction' is required".to_string(),
                        ));
                    }
                };
                Ok(Action::Swipe { target })
            }
            "type_text" => {
                let args = parse_args::<TypeTextArgs>(wire.action_args, "type_text")?;
                Ok(Action::TypeText {
                    index: args.index,
                    text: args.text,
                })
            }
            "back" => Ok(Action::Back),
            "home" => Ok(Action::Home),
            "wait" => {
                let args = parse_args::<WaitArgs>(wire.action_args, "wait")?;
                Ok(Action::Wait {
                    seconds: clamp_wait_secs(args.seconds.unwrap_or(DEFAULT_WAIT_SECS)),
                })
            }
            "finish" => {
                let args = parse_args::<FinishArgs>(wire.action_args, "finish")?;
                Ok(Action::Finish {
                    result: args.result,
                })
            }
            other => Err(ParseFailure::Schema(format!(
                "unknown action name: {}",
                other
            ))),
        }
    }
}

/// Parse raw model text into a validated [`Decision`].
///
/// When the structural parse fails and `repair_enabled` is set, the text goes
/// through [`repair::repair_json`] once before giving up.
pub fn parse_decision(raw: &str, repair_enabled: bool) -> ParseResult<Decision> {
    let wire = match serde_json::from_str::<DecisionWire>(raw.trim()) {
        Ok(wire) => wire,
        Err(first_err) if first_err.is_syntax() || first_err.is_eof() => {
            let repaired = if repair_enabled {
                repair::repair_json(raw)
            } else {
                None
            };
            match repaired {
                Some(fixed) => serde_json::from_str::<DecisionWire>(&fixed)
                    .map_err(|e| classify_serde_error(&fixed, e))?,
                None => return Err(ParseFailure::Structural(first_err.to_string())),
            }
        }
        Err(data_err) => return Err(classify_serde_error(raw, data_err)),
    };

    let thought = wire.thought.clone();
    let action = Action::try_from(wire)?;
    Ok(Decision { thought, action })
}

/// Valid JSON that misses the contract is a schema fault, not a structural one.
fn classify_serde_error(raw: &str, err: serde_json::Error) -> ParseFailure {
    if serde_json::from_str::<serde_json::Value>(raw.trim()).is_ok() {
        ParseFailure::Schema(err.to_string())
    } else {
        ParseFailure::Structural(err.to_string())
    }
}

/// Check that every element reference in the action exists in the observation.
///
/// Out-of-range references must never reach the actuator.
pub fn validate_references(action: &Action, elements: &[Element]) -> ParseResult<()> {
    if let Some(index) = action.referenced_index() {
        if !elements.iter().any(|el| el.index == index) {
            return Err(ParseFailure::Reference(format!(
                "element index {} is not present on the current screen",
                index
            )));
        }
    }
    Ok(())
}
