//! Core data model and seams of the control loop.
//!
//! The loop talks to the outside world through two traits: [`DeviceIo`] for
//! the device bridge and [`Inference`] for the reasoning provider. Production
//! wires adb and the chat client in; tests inject fakes with scripted
//! observations and responses.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::action::Action;
use crate::device::DeviceError;
use crate::llm::{InferenceReply, LlmError, TokenUsage};
use crate::ui::Element;

/// Everything sensed from the device for one step.
///
/// Immutable once captured; element indices stay valid for the whole step.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// PNG screenshot bytes
    pub screenshot: Vec<u8>,
    /// Raw uiautomator hierarchy dump
    pub layout_xml: String,
    /// Simplified elements in document order, indices 1-based
    pub elements: Vec<Element>,
    /// Rendered element listing as sent to the model
    pub listing: String,
}

/// One prompt/response round with the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// 1-based attempt number within the step
    pub attempt: u32,
    /// Full prompt text (images elided)
    pub prompt: String,
    /// Raw response text, when the call returned
    pub response: Option<String>,
    /// Provider or validation error, when the attempt failed
    pub error: Option<String>,
    /// Token usage for this call
    pub usage: TokenUsage,
}

/// What happened when the step's resolved action was carried out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The action was dispatched and accepted
    Executed,
    /// The model declared the task finished; nothing was dispatched
    TaskCompleted,
    /// The bridge refused the action; recorded, not retried
    Rejected(String),
    /// No action was resolved for this step (attempt budget exhausted)
    NoAction(String),
    /// An environment fault ended the run at this step
    Fault(String),
}

/// Why a run ended. Exactly one is recorded per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The model reported the task done via `finish`
    Completed,
    /// The step limit was reached first
    MaxStepsReached,
    /// A step exhausted its attempt budget
    RetriesExhausted,
    /// An environment or configuration fault
    FatalError,
    /// An external stop request was observed
    Cancelled,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::MaxStepsReached => "max_steps_reached",
            TerminalStatus::RetriesExhausted => "retries_exhausted",
            TerminalStatus::FatalError => "fatal_error",
            TerminalStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Device-side collaborator: sensing and actuation
pub trait DeviceIo {
    /// Stable identifier of the device (adb serial)
    fn device_id(&self) -> &str;

    /// Capture a fresh screenshot and hierarchy and simplify it.
    ///
    /// Failure here is an environment fault, fatal to the run.
    fn capture_observation(&mut self) -> Result<Observation, DeviceError>;

    /// Carry out a validated action against the device.
    ///
    /// `elements` is the observation the action was validated against; the
    /// implementation must reject, not coerce, an index it cannot find.
    fn dispatch_action(&mut self, action: &Action, elements: &[Element]) -> Result<(), DeviceError>;
}

/// Reasoning collaborator: one completion call
pub trait Inference {
    fn infer(&mut self, prompt: &str, images: &[Vec<u8>]) -> Result<InferenceReply, LlmError>;
}

impl<T: DeviceIo + ?Sized> DeviceIo for Box<T> {
    fn device_id(&self) -> &str {
        (**self).device_id()
    }

    fn capture_observation(&mut self) -> Result<Observation, DeviceError> {
        (**self).capture_observation()
    }

    fn dispatch_action(&mut self, action: &Action, elements: &[Element]) -> Result<(), DeviceError> {
        (**self).dispatch_action(action, elements)
    }
}

impl<T: Inference + ?Sized> Inference for Box<T> {
    fn infer(&mut self, prompt: &str, images: &[Vec<u8>]) -> Result<InferenceReply, LlmError> {
        (**self).infer(prompt, images)
    }
}

/// Cooperatively observed stop request.
///
/// The loop checks it at every state boundary; a cancelled run still
/// finalizes with a recorded terminal status.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
