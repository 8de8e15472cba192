//! droid-pilot - LLM-driven Android UI automation.
//!
//! This crate provides:
//! - An observe-think-act step loop that drives one Android device toward a
//!   natural-language goal, with per-step retry budgets and full tracing
//! - UI hierarchy simplification (uiautomator XML to indexed element lists)
//! - A typed action contract over the model's JSON responses, with
//!   best-effort repair of malformed output
//! - A chat-completions client with streaming, activity timeouts and token
//!   accounting
//! - Append-only run traces and derived run summaries
//! - A fleet orchestrator running one isolated loop per connected device
//!
//! # Example
//!
//! ```rust,no_run
//! use droid_pilot::agent::StepLoop;
//! use droid_pilot::config;
//! use droid_pilot::device::AdbDevice;
//! use droid_pilot::llm::{ChatClient, LlmConfig};
//! use droid_pilot::trace::InfoPool;
//!
//! let mut device = AdbDevice::new("emulator-5554");
//! let mut llm = ChatClient::new(LlmConfig::default());
//! let pool = InfoPool::create("runs", "open the settings app", "emulator-5554").unwrap();
//! let settings = config::get().agent.clone();
//! let summary = StepLoop::new(&mut device, &mut llm, settings).run("open the settings app", pool);
//! println!("{} after {} steps", summary.final_status, summary.total_steps);
//! ```

pub mod action;
pub mod agent;
pub mod config;
pub mod device;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod repair;
pub mod trace;
pub mod ui;

// Re-export the action contract
pub use action::{Action, Decision, ParseFailure, SwipeDirection, SwipeTarget, parse_decision, validate_references};

// Re-export the loop and its seams
pub use agent::{CancelToken, DeviceIo, ExecutionOutcome, Inference, Observation, StepLoop, TerminalStatus};

// Re-export device access
pub use device::{AdbBridge, AdbDevice, DeviceError};

// Re-export the provider client
pub use llm::{ChatClient, InferenceReply, LlmConfig, LlmError, TokenUsage, check_health};

// Re-export tracing types
pub use trace::{InfoPool, RunSummary, StepRecord};

// Re-export orchestration
pub use orchestrator::{TaskQueue, run_fleet};

// Re-export the simplifier
pub use ui::{Bounds, Element, Viewport, render_elements, simplify};
