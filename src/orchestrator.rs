//! Fleet supervision: one independent control loop per connected device.
//!
//! Pending tasks live in a single-owner [`TaskQueue`]; each device's worker
//! thread pops the next task under the queue lock and runs it to a terminal
//! summary. Workers share nothing else. A panic inside one device's loop is
//! caught at the worker boundary and converted into a `fatal_error` summary,
//! so one misbehaving device can never take the others down or leave a run
//! without a recorded terminal state.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, mpsc};
use std::thread;

use chrono::Utc;
use tracing::{error, info};

use crate::agent::types::{CancelToken, DeviceIo, Inference, TerminalStatus};
use crate::agent::StepLoop;
use crate::config::AgentSettings;
use crate::llm::TokenUsage;
use crate::trace::{InfoPool, RunSummary};

/// Boxed collaborators for one run, produced per (device, task) assignment
pub type RunParts = (Box<dyn DeviceIo + Send>, Box<dyn Inference + Send>);

/// Mutation-guarded pending-task container.
///
/// `pop` is the only mutating operation; an assignment is not reversible once
/// popped.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<String>>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<String>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into()),
        }
    }

    /// Atomically take the next pending task
    pub fn pop(&self) -> Option<String> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run every queued task across the given devices and collect the summaries.
///
/// `factory` builds the device bridge and provider client for one
/// assignment; it is called once per run, inside that device's worker
/// thread. Summaries arrive in completion order.
pub fn run_fleet<F>(
    devices: &[String],
    tasks: Vec<String>,
    settings: &AgentSettings,
    runs_dir: &Path,
    cancel: &CancelToken,
    factory: F,
) -> Vec<RunSummary>
where
    F: Fn(&str) -> RunParts + Sync,
{
    let queue = TaskQueue::new(tasks);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for serial in devices {
            let tx = tx.clone();
            let queue = &queue;
            let factory = &factory;
            let cancel = cancel.clone();
            let runs_dir = runs_dir.to_path_buf();
            let settings = settings.clone();
            scope.spawn(move || {
                info!(device = %serial, "worker started");
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(task) = queue.pop() else {
                        break;
                    };
                    let summary = run_one(
                        serial,
                        &task,
                        &runs_dir,
                        settings.clone(),
                        cancel.clone(),
                        factory,
                    );
                    if tx.send(summary).is_err() {
                        break;
                    }
                }
                info!(device = %serial, "worker finished");
            });
        }
        drop(tx);
    });

    rx.into_iter().collect()
}

/// Execute a single (device, task) assignment to a terminal summary.
///
/// Faults below this point are already converted into terminal statuses by
/// the step loop; this boundary additionally absorbs panics and trace-setup
/// failures so the caller always gets a summary back.
fn run_one<F>(
    serial: &str,
    task: &str,
    runs_dir: &Path,
    settings: AgentSettings,
    cancel: CancelToken,
    factory: &F,
) -> RunSummary
where
    F: Fn(&str) -> RunParts + Sync,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        let pool = match InfoPool::create(runs_dir, task, serial) {
            Ok(pool) => pool,
            Err(e) => {
                error!(device = serial, error = %e, "could not create run directory");
                return synthesized_summary(
                    task,
                    serial,
                    TerminalStatus::FatalError,
                    format!("Run directory could not be created: {}", e),
                );
            }
        };
        let (mut device, mut llm) = factory(serial);
        StepLoop::new(&mut device, &mut llm, settings)
            .with_cancel(cancel)
            .run(task, pool)
    }));

    match result {
        Ok(summary) => summary,
        Err(panic) => {
            let detail = panic_message(&panic);
            error!(device = serial, detail, "run panicked");
            synthesized_summary(
                task,
                serial,
                TerminalStatus::FatalError,
                format!("Run aborted by panic: {}", detail),
            )
        }
    }
}

/// Terminal summary for runs that never got a working trace recorder
fn synthesized_summary(
    task: &str,
    device_id: &str,
    status: TerminalStatus,
    text: String,
) -> RunSummary {
    let now = Utc::now();
    RunSummary {
        task: task.to_string(),
        device_id: device_id.to_string(),
        run_start_time: now,
        run_end_time: now,
        duration_seconds: 0.0,
        final_status: status,
        total_steps: 0,
        token_usage: TokenUsage::default(),
        summary_text: text,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Convenience path builder: the configured runs directory
pub fn default_runs_dir() -> PathBuf {
    PathBuf::from(crate::config::runs_base_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::agent::types::Observation;
    use crate::device::DeviceError;
    use crate::llm::{InferenceReply, LlmError};
    use crate::ui::Element;

    struct ScriptedDevice {
        serial: String,
        panic_on_capture: bool,
    }

    impl DeviceIo for ScriptedDevice {
        fn device_id(&self) -> &str {
            &self.serial
        }

        fn capture_observation(&mut self) -> Result<Observation, DeviceError> {
            if self.panic_on_capture {
                panic!("simulated bridge crash");
            }
            Ok(Observation {
                screenshot: Vec::new(),
                layout_xml: "<hierarchy/>".to_string(),
                elements: Vec::new(),
                listing: String::new(),
            })
        }

        fn dispatch_action(&mut self, _: &Action, _: &[Element]) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    struct FinishLlm;

    impl Inference for FinishLlm {
        fn infer(&mut self, _: &str, _: &[Vec<u8>]) -> Result<InferenceReply, LlmError> {
            Ok(InferenceReply {
                text: r#"{"thought":"done","action":"finish","action_args":{"result":"ok"}}"#
                    .to_string(),
                usage: crate::llm::TokenUsage::default(),
            })
        }
    }

    fn quiet_settings() -> AgentSettings {
        AgentSettings {
            step_delay_ms: 0,
            vision_enabled: false,
            ..AgentSettings::defaults()
        }
    }

    #[test]
    fn test_task_queue_pops_in_order_until_empty() {
        let queue = TaskQueue::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fleet_runs_every_task() {
        let tmp = tempfile::tempdir().unwrap();
        let devices = vec!["dev-1".to_string(), "dev-2".to_string()];
        let tasks = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];

        let summaries = run_fleet(
            &devices,
            tasks,
            &quiet_settings(),
            tmp.path(),
            &CancelToken::new(),
            |serial| {
                (
                    Box::new(ScriptedDevice {
                        serial: serial.to_string(),
                        panic_on_capture: false,
                    }) as Box<dyn DeviceIo + Send>,
                    Box::new(FinishLlm) as Box<dyn Inference + Send>,
                )
            },
        );

        assert_eq!(summaries.len(), 3);
        assert!(summaries
            .iter()
            .all(|s| s.final_status == TerminalStatus::Completed));
        let mut tasks_seen: Vec<_> = summaries.iter().map(|s| s.task.clone()).collect();
        tasks_seen.sort();
        assert_eq!(tasks_seen, vec!["t1", "t2", "t3"]);
    }

    /// Panics while handling the crash-me task; finishes everything else.
    struct TaskSensitiveLlm;

    impl Inference for TaskSensitiveLlm {
        fn infer(&mut self, prompt: &str, _: &[Vec<u8>]) -> Result<InferenceReply, LlmError> {
            if prompt.contains("crash-me") {
                panic!("simulated loop crash");
            }
            FinishLlm.infer(prompt, &[])
        }
    }

    #[test]
    fn test_crash_in_one_run_does_not_disturb_the_others() {
        let tmp = tempfile::tempdir().unwrap();
        let devices = vec!["dev-1".to_string(), "dev-2".to_string()];
        let tasks = vec!["t1".to_string(), "crash-me".to_string()];

        let summaries = run_fleet(
            &devices,
            tasks,
            &quiet_settings(),
            tmp.path(),
            &CancelToken::new(),
            |serial| {
                (
                    Box::new(ScriptedDevice {
                        serial: serial.to_string(),
                        panic_on_capture: false,
                    }) as Box<dyn DeviceIo + Send>,
                    Box::new(TaskSensitiveLlm) as Box<dyn Inference + Send>,
                )
            },
        );

        // Both assignments end in a terminal summary regardless of the crash.
        assert_eq!(summaries.len(), 2);
        let crashed = summaries.iter().find(|s| s.task == "crash-me").unwrap();
        assert_eq!(crashed.final_status, TerminalStatus::FatalError);
        assert!(crashed.summary_text.contains("panic"));
        let healthy = summaries.iter().find(|s| s.task == "t1").unwrap();
        assert_eq!(healthy.final_status, TerminalStatus::Completed);
    }

    #[test]
    fn test_cancelled_fleet_stops_pulling_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let summaries = run_fleet(
            &["dev-1".to_string()],
            vec!["t1".to_string(), "t2".to_string()],
            &quiet_settings(),
            tmp.path(),
            &cancel,
            |serial| {
                (
                    Box::new(ScriptedDevice {
                        serial: serial.to_string(),
                        panic_on_capture: false,
                    }) as Box<dyn DeviceIo + Send>,
                    Box::new(FinishLlm) as Box<dyn Inference + Send>,
                )
            },
        );

        // Cancelled before any pop: no runs started at all.
        assert!(summaries.is_empty());
    }
}
