//! The step loop: the state machine that turns an unreliable reasoning
//! service into a bounded, recoverable, fully-traced sequence of device
//! actions.
//!
//! Per step: `OBSERVE -> PROMPT -> INFER -> VALIDATE -> {ACT | RETRY |
//! ABORT_STEP} -> RECORD`, then either the next step or a terminal status.
//! Observation happens once per step; validation and provider faults retry
//! by re-prompting (with the error restated) within a per-step attempt
//! budget that resets on every new step. Environment faults are never
//! retried. Every path records its step and every run finalizes with exactly
//! one terminal status.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::action::{self, Decision};
use crate::agent::types::{
    CancelToken, DeviceIo, ExchangeRecord, ExecutionOutcome, Inference, Observation,
    TerminalStatus,
};
use crate::config::AgentSettings;
use crate::device::DeviceError;
use crate::llm::TokenUsage;
use crate::prompt::{self, HistoryEntry};
use crate::trace::{InfoPool, RunSummary, StepRecord};

/// One run's control loop over a device and a reasoning provider.
///
/// The loop owns nothing external: device I/O and inference come in through
/// the [`DeviceIo`] and [`Inference`] seams, trace output goes to the
/// [`InfoPool`] handed to [`StepLoop::run`].
pub struct StepLoop<'a, D: DeviceIo, L: Inference> {
    device: &'a mut D,
    llm: &'a mut L,
    settings: AgentSettings,
    cancel: CancelToken,
}

/// Accumulated state of the step currently being built
struct StepState {
    step: u32,
    started: Instant,
    timestamp: chrono::DateTime<chrono::Utc>,
    observation: Option<Observation>,
    exchanges: Vec<ExchangeRecord>,
    tokens: TokenUsage,
}

impl StepState {
    fn begin(step: u32) -> Self {
        Self {
            step,
            started: Instant::now(),
            timestamp: Utc::now(),
            observation: None,
            exchanges: Vec::new(),
            tokens: TokenUsage::default(),
        }
    }

    fn into_record(self, decision: Option<Decision>, outcome: ExecutionOutcome) -> StepRecord {
        StepRecord {
            step: self.step,
            timestamp: self.timestamp,
            duration_ms: self.started.elapsed().as_millis() as u64,
            observation: self.observation,
            exchanges: self.exchanges,
            decision,
            outcome,
            tokens: self.tokens,
        }
    }
}

impl<'a, D: DeviceIo, L: Inference> StepLoop<'a, D, L> {
    pub fn new(device: &'a mut D, llm: &'a mut L, settings: AgentSettings) -> Self {
        Self {
            device,
            llm,
            settings,
            cancel: CancelToken::new(),
        }
    }

    /// Attach an externally controlled stop request
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive the task to a terminal status, recording every step into `pool`.
    ///
    /// Always returns a finalized [`RunSummary`]; no fault path leaves the
    /// run without one.
    pub fn run(mut self, task: &str, mut pool: InfoPool) -> RunSummary {
        let max_steps = self.settings.max_steps.max(1);
        let mut history: VecDeque<HistoryEntry> = VecDeque::new();
        let mut prev_screenshot: Option<Vec<u8>> = None;

        info!(task, device = self.device.device_id(), max_steps, "run started");

        for step in 1..=max_steps {
            if self.cancel.is_cancelled() {
                return pool.finalize(
                    TerminalStatus::Cancelled,
                    format!("Stop requested before step {}.", step),
                );
            }
            if step > 1 && self.settings.step_delay_ms > 0 {
                thread::sleep(Duration::from_millis(self.settings.step_delay_ms));
            }

            let mut state = StepState::begin(step);
            info!(step, "step started");

            // OBSERVE: one fresh observation per step; failure is an
            // environment fault and ends the run.
            let observation = match self.device.capture_observation() {
                Ok(obs) => obs,
                Err(e) => {
                    let detail = e.to_string();
                    self.record(&mut pool, state.into_record(None, ExecutionOutcome::Fault(detail.clone())));
                    return pool.finalize(
                        TerminalStatus::FatalError,
                        format!("Observation failed at step {}: {}", step, detail),
                    );
                }
            };
            state.observation = Some(observation);
            let elements_listing = state.observation.as_ref().map(|o| o.listing.clone()).unwrap_or_default();

            if self.cancel.is_cancelled() {
                return self.finish_cancelled(pool, state, step);
            }

            // Prompt images are prepared once per step: previous screen (when
            // available) then current, both optionally downscaled.
            let images = self.prompt_images(&prev_screenshot, state.observation.as_ref().unwrap());

            // PROMPT / INFER / VALIDATE with a per-step attempt budget.
            let budget = if self.settings.retry_enabled {
                self.settings.retry_attempts.max(1)
            } else {
                1
            };
            let mut decision: Option<Decision> = None;
            let mut last_error: Option<String> = None;

            for attempt in 1..=budget {
                let mut prompt_text = if step == 1 {
                    prompt::first_step_prompt(task, &elements_listing)
                } else {
                    let recent: Vec<HistoryEntry> = history.iter().cloned().collect();
                    prompt::followup_prompt(task, &recent, &elements_listing)
                };
                if let Some(err) = &last_error {
                    prompt_text.push_str(&prompt::retry_suffix(err));
                }

                if self.cancel.is_cancelled() {
                    return self.finish_cancelled(pool, state, step);
                }

                match self.llm.infer(&prompt_text, &images) {
                    Err(e) if e.is_fatal() => {
                        let detail = e.to_string();
                        state.exchanges.push(ExchangeRecord {
                            attempt,
                            prompt: prompt_text,
                            response: None,
                            error: Some(detail.clone()),
                            usage: TokenUsage::default(),
                        });
                        self.record(&mut pool, state.into_record(None, ExecutionOutcome::Fault(detail.clone())));
                        return pool.finalize(
                            TerminalStatus::FatalError,
                            format!("Provider rejected the run at step {}: {}", step, detail),
                        );
                    }
                    Err(e) => {
                        let detail = format!("provider error: {}", e);
                        warn!(step, attempt, error = %detail, "inference attempt failed");
                        state.exchanges.push(ExchangeRecord {
                            attempt,
                            prompt: prompt_text,
                            response: None,
                            error: Some(detail.clone()),
                            usage: TokenUsage::default(),
                        });
                        last_error = Some(detail);
                    }
                    Ok(reply) => {
                        state.tokens.accumulate(reply.usage);
                        let validated = action::parse_decision(
                            &reply.text,
                            self.settings.repair_enabled,
                        )
                        .and_then(|d| {
                            let elements = &state.observation.as_ref().unwrap().elements;
                            action::validate_references(&d.action, elements).map(|_| d)
                        });
                        match validated {
                            Ok(d) => {
                                state.exchanges.push(ExchangeRecord {
                                    attempt,
                                    prompt: prompt_text,
                                    response: Some(reply.text),
                                    error: None,
                                    usage: reply.usage,
                                });
                                decision = Some(d);
                            }
                            Err(failure) => {
                                let detail = failure.to_string();
                                warn!(step, attempt, error = %detail, "response rejected");
                                state.exchanges.push(ExchangeRecord {
                                    attempt,
                                    prompt: prompt_text,
                                    response: Some(reply.text),
                                    error: Some(detail.clone()),
                                    usage: reply.usage,
                                });
                                last_error = Some(detail);
                            }
                        }
                    }
                }
                if decision.is_some() {
                    break;
                }
            }

            // ABORT_STEP: the budget ran dry without a usable decision.
            let Some(decision) = decision else {
                let detail = last_error.unwrap_or_else(|| "no attempts were made".to_string());
                self.record(
                    &mut pool,
                    state.into_record(None, ExecutionOutcome::NoAction(detail.clone())),
                );
                return pool.finalize(
                    TerminalStatus::RetriesExhausted,
                    format!("Step {} exhausted its {} attempt(s). Last error: {}", step, budget, detail),
                );
            };

            info!(step, thought = %decision.thought, action = %decision.action, "decision resolved");

            if self.cancel.is_cancelled() {
                return self.finish_cancelled(pool, state, step);
            }

            // ACT
            if let crate::action::Action::Finish { result } = &decision.action {
                let result = result.clone();
                self.record(
                    &mut pool,
                    state.into_record(Some(decision), ExecutionOutcome::TaskCompleted),
                );
                return pool.finalize(TerminalStatus::Completed, result);
            }

            let elements = state.observation.as_ref().unwrap().elements.clone();
            let outcome = match self.device.dispatch_action(&decision.action, &elements) {
                Ok(()) => ExecutionOutcome::Executed,
                Err(DeviceError::Rejected(reason)) => {
                    // The bridge refused the action: recorded, the step
                    // counts as failed, the run continues.
                    warn!(step, %reason, "action rejected by the device bridge");
                    ExecutionOutcome::Rejected(reason)
                }
                Err(e) => {
                    let detail = e.to_string();
                    self.record(
                        &mut pool,
                        state.into_record(Some(decision), ExecutionOutcome::Fault(detail.clone())),
                    );
                    return pool.finalize(
                        TerminalStatus::FatalError,
                        format!("Action dispatch failed at step {}: {}", step, detail),
                    );
                }
            };

            // RECORD, then roll the step's context into the next prompt.
            history.push_back(HistoryEntry {
                step,
                thought: decision.thought.clone(),
                action: decision.action.to_string(),
            });
            while history.len() > self.settings.history_window {
                history.pop_front();
            }
            prev_screenshot = images.last().cloned();

            self.record(&mut pool, state.into_record(Some(decision), outcome));
        }

        pool.finalize(
            TerminalStatus::MaxStepsReached,
            format!("Task stopped after reaching {} steps.", max_steps),
        )
    }

    fn finish_cancelled(&self, mut pool: InfoPool, state: StepState, step: u32) -> RunSummary {
        self.record(
            &mut pool,
            state.into_record(None, ExecutionOutcome::NoAction("cancelled".to_string())),
        );
        pool.finalize(
            TerminalStatus::Cancelled,
            format!("Stop requested during step {}.", step),
        )
    }

    fn record(&self, pool: &mut InfoPool, record: StepRecord) {
        if let Err(e) = pool.record_step(record) {
            warn!(error = %e, "failed to persist step record");
        }
    }

    /// Screenshots attached to the prompt: previous screen first (when one
    /// exists), then the current one, downscaled per configuration.
    fn prompt_images(&self, prev: &Option<Vec<u8>>, obs: &Observation) -> Vec<Vec<u8>> {
        if !self.settings.vision_enabled {
            return Vec::new();
        }
        let current = downscale_png(&obs.screenshot, self.settings.image_scale);
        match prev {
            Some(prev) => vec![prev.clone(), current],
            None => vec![current],
        }
    }
}

/// Downscale a PNG screenshot by `scale` before attaching it to a prompt.
///
/// Anything that fails falls back to the original bytes; a full-size
/// screenshot is better than none.
fn downscale_png(png: &[u8], scale: f32) -> Vec<u8> {
    if scale <= 0.0 || scale >= 1.0 || png.is_empty() {
        return png.to_vec();
    }
    let Ok(img) = image::load_from_memory(png) else {
        warn!("screenshot could not be decoded for downscaling");
        return png.to_vec();
    };
    let width = ((img.width() as f32 * scale) as u32).max(1);
    let height = ((img.height() as f32 * scale) as u32).max(1);
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Lanczos3);
    let mut out = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out);
    if resized.write_to(&mut cursor, image::ImageFormat::Png).is_err() {
        return png.to_vec();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::llm::{InferenceReply, LlmError};
    use crate::ui::Element;
    use std::collections::VecDeque;

    /// Scripted device: queued observations, every dispatch recorded.
    struct FakeDevice {
        observations: VecDeque<Result<Observation, DeviceError>>,
        dispatched: Vec<Action>,
        dispatch_results: VecDeque<Result<(), DeviceError>>,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self {
                observations: VecDeque::new(),
                dispatched: Vec::new(),
                dispatch_results: VecDeque::new(),
            }
        }

        fn push_observation(&mut self, obs: Observation) {
            self.observations.push_back(Ok(obs));
        }
    }

    impl DeviceIo for FakeDevice {
        fn device_id(&self) -> &str {
            "fake-device"
        }

        fn capture_observation(&mut self) -> Result<Observation, DeviceError> {
            self.observations
                .pop_front()
                .unwrap_or_else(|| Err(DeviceError::Unreachable("no observation queued".to_string())))
        }

        fn dispatch_action(&mut self, action: &Action, _elements: &[Element]) -> Result<(), DeviceError> {
            self.dispatched.push(action.clone());
            self.dispatch_results.pop_front().unwrap_or(Ok(()))
        }
    }

    /// Scripted provider: queued raw responses or errors.
    struct FakeLlm {
        responses: VecDeque<Result<String, LlmError>>,
        prompts: Vec<String>,
    }

    impl FakeLlm {
        fn new() -> Self {
            Self {
                responses: VecDeque::new(),
                prompts: Vec::new(),
            }
        }

        fn push(&mut self, raw: impl Into<String>) {
            self.responses.push_back(Ok(raw.into()));
        }
    }

    impl Inference for FakeLlm {
        fn infer(&mut self, prompt: &str, _images: &[Vec<u8>]) -> Result<InferenceReply, LlmError> {
            self.prompts.push(prompt.to_string());
            match self.responses.pop_front() {
                Some(Ok(text)) => Ok(InferenceReply {
                    text,
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                }),
                Some(Err(e)) => Err(e),
                None => Ok(InferenceReply {
                    text: "{}".to_string(),
                    usage: TokenUsage::default(),
                }),
            }
        }
    }

    fn observation() -> Observation {
        let xml = r#"<?xml version='1.0'?><hierarchy>
            <node class="android.widget.Button" text="OK" bounds="[0,0][100,50]"
                clickable="true" enabled="true"/>
        </hierarchy>"#;
        let elements = crate::ui::simplify(xml, crate::ui::Viewport::default()).unwrap();
        let listing = crate::ui::render_elements(&elements);
        Observation {
            screenshot: Vec::new(),
            layout_xml: xml.to_string(),
            elements,
            listing,
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            step_delay_ms: 0,
            vision_enabled: false,
            ..AgentSettings::defaults()
        }
    }

    fn pool() -> (tempfile::TempDir, InfoPool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = InfoPool::create(tmp.path(), "test task", "fake-device").unwrap();
        (tmp, pool)
    }

    const TAP: &str = r#"{"thought":"t","action":"tap","action_args":{"index":1}}"#;
    const FINISH: &str = r#"{"thought":"done","action":"finish","action_args":{"result":"all good"}}"#;

    #[test]
    fn completes_when_model_finishes() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        for _ in 0..2 {
            device.push_observation(observation());
        }
        llm.push(TAP);
        llm.push(FINISH);

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::Completed);
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.summary_text, "all good");
        // finish is never dispatched to the device
        assert_eq!(device.dispatched, vec![Action::Tap { index: 1 }]);
        assert_eq!(summary.token_usage.total_tokens, 30);
    }

    #[test]
    fn unparsable_without_retry_ends_after_one_step() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        llm.push("complete garbage");

        let mut cfg = settings();
        cfg.retry_enabled = false;
        cfg.max_steps = 3;

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, cfg).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::RetriesExhausted);
        assert_eq!(summary.total_steps, 1);
        assert!(device.dispatched.is_empty());
        assert_eq!(llm.prompts.len(), 1);
    }

    #[test]
    fn retry_reprompts_with_error_and_recovers() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        llm.push(r#"{"thought":"","action":"fly","action_args":{}}"#);
        llm.push(FINISH);

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::Completed);
        assert_eq!(summary.total_steps, 1);
        assert_eq!(llm.prompts.len(), 2);
        assert!(llm.prompts[1].contains("unknown action name"));
    }

    #[test]
    fn reference_error_never_reaches_the_device() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        // Element 99 is not on screen; all attempts return it.
        for _ in 0..3 {
            llm.push(r#"{"thought":"","action":"tap","action_args":{"index":99}}"#);
        }

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::RetriesExhausted);
        assert!(device.dispatched.is_empty());
    }

    #[test]
    fn observation_fault_is_fatal_and_recorded() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device
            .observations
            .push_back(Err(DeviceError::Unreachable("device offline".to_string())));

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::FatalError);
        assert_eq!(summary.total_steps, 1);
        assert!(summary.summary_text.contains("device offline"));
    }

    #[test]
    fn rejected_action_is_recorded_and_loop_continues() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        device.push_observation(observation());
        device.dispatch_results.push_back(Err(DeviceError::Rejected("input busy".to_string())));
        llm.push(TAP);
        llm.push(FINISH);

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::Completed);
        assert_eq!(summary.total_steps, 2);
    }

    #[test]
    fn max_steps_bound_is_honored() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        let mut cfg = settings();
        cfg.max_steps = 3;
        for _ in 0..3 {
            device.push_observation(observation());
            llm.push(TAP);
        }

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, cfg).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::MaxStepsReached);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(device.dispatched.len(), 3);
    }

    #[test]
    fn provider_auth_error_is_fatal() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        llm.responses.push_back(Err(LlmError::Auth("bad key".to_string())));

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::FatalError);
        assert!(summary.summary_text.contains("bad key"));
    }

    #[test]
    fn provider_transient_errors_consume_the_attempt_budget() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        for _ in 0..3 {
            llm.responses
                .push_back(Err(LlmError::ConnectionFailed("overloaded".to_string())));
        }

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings()).run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::RetriesExhausted);
        assert_eq!(llm.prompts.len(), 3);
    }

    #[test]
    fn cancellation_produces_a_terminal_summary() {
        let mut device = FakeDevice::new();
        let mut llm = FakeLlm::new();
        device.push_observation(observation());
        let cancel = CancelToken::new();
        cancel.cancel();

        let (_tmp, pool) = pool();
        let summary = StepLoop::new(&mut device, &mut llm, settings())
            .with_cancel(cancel)
            .run("test task", pool);

        assert_eq!(summary.final_status, TerminalStatus::Cancelled);
    }

    #[test]
    fn downscale_keeps_original_on_undecodable_input() {
        let bytes = vec![1, 2, 3];
        assert_eq!(downscale_png(&bytes, 0.5), bytes);
        // scale 1.0 disables downscaling entirely
        assert_eq!(downscale_png(&bytes, 1.0), bytes);
    }

    #[test]
    fn downscale_halves_dimensions() {
        let img = image::DynamicImage::new_rgb8(100, 60);
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let out = downscale_png(&png, 0.5);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 50);
        assert_eq!(decoded.height(), 30);
    }
}
