//! Append-only run tracing.
//!
//! One [`InfoPool`] per run, owned by that run's step loop. Steps are
//! recorded in strictly increasing order; recording the same step number
//! twice is a programming error and panics. [`InfoPool::finalize`] consumes
//! the pool, so a second finalize cannot be written.
//!
//! On-disk layout, under the run directory:
//! - one directory per step: `step_NNN/screenshot.png`, `layout.xml`,
//!   `simplified_layout.txt`, `step_details.json`
//! - `summary.json`: the run summary
//! - `execution_trace.json`: summary metadata plus every step record, with
//!   large blobs replaced by their relative paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::action::Decision;
use crate::agent::types::{ExchangeRecord, ExecutionOutcome, Observation, TerminalStatus};
use crate::llm::TokenUsage;

/// Everything the loop hands over when a step completes
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// 1-based, monotonic within the run
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// `None` only when observation acquisition itself failed
    pub observation: Option<Observation>,
    /// Every provider round of this step, in attempt order
    pub exchanges: Vec<ExchangeRecord>,
    /// The validated decision, when one was resolved
    pub decision: Option<Decision>,
    pub outcome: ExecutionOutcome,
    /// Token usage summed over the step's exchanges
    pub tokens: TokenUsage,
}

/// Derived once per run at finalize time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub task: String,
    pub device_id: String,
    pub run_start_time: DateTime<Utc>,
    pub run_end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub final_status: TerminalStatus,
    pub total_steps: u32,
    pub token_usage: TokenUsage,
    pub summary_text: String,
}

/// Serialized form of one step inside `execution_trace.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TraceStep {
    step: u32,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    observation: Option<TraceObservation>,
    exchanges: Vec<ExchangeRecord>,
    decision: Option<Decision>,
    outcome: ExecutionOutcome,
    tokens: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TraceObservation {
    screenshot_path: PathBuf,
    layout_path: PathBuf,
    simplified_layout_path: PathBuf,
    element_count: usize,
}

/// Append-only record keeper for one run
#[derive(Debug)]
pub struct InfoPool {
    run_dir: PathBuf,
    task: String,
    device_id: String,
    started_at: DateTime<Utc>,
    trace: Vec<TraceStep>,
    last_step: u32,
    tokens: TokenUsage,
}

impl InfoPool {
    /// Create a pool with a fresh run directory under `base_dir`, named
    /// `YYYYMMDD_HHMMSS_<task>_<device>`.
    pub fn create(
        base_dir: impl AsRef<Path>,
        task: impl Into<String>,
        device_id: impl Into<String>,
    ) -> std::io::Result<Self> {
        let task = task.into();
        let device_id = device_id.into();
        let started_at = Utc::now();
        let dir_name = format!(
            "{}_{}_{}",
            started_at.format("%Y%m%d_%H%M%S"),
            truncate(&sanitize_name(&task), 50),
            sanitize_name(&device_id)
        );
        let run_dir = base_dir.as_ref().join(dir_name);
        fs::create_dir_all(&run_dir)?;
        info!(run_dir = %run_dir.display(), "run directory created");
        Ok(Self {
            run_dir,
            task,
            device_id,
            started_at,
            trace: Vec::new(),
            last_step: 0,
            tokens: TokenUsage::default(),
        })
    }

    /// Directory holding this run's output
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of steps recorded so far
    pub fn step_count(&self) -> u32 {
        self.last_step
    }

    /// Persist one completed step.
    ///
    /// Steps must arrive in order with no gaps; anything else is a bug in
    /// the loop, not a recoverable condition. Disk errors are returned so the
    /// caller can log them, but the in-memory trace is kept regardless.
    pub fn record_step(&mut self, record: StepRecord) -> std::io::Result<()> {
        assert_eq!(
            record.step,
            self.last_step + 1,
            "step records must be appended in order (got {}, expected {})",
            record.step,
            self.last_step + 1
        );
        self.last_step = record.step;
        self.tokens.accumulate(record.tokens);

        let step_folder = format!("step_{:03}", record.step);
        let step_dir = self.run_dir.join(&step_folder);

        let observation = record.observation.as_ref().map(|obs| TraceObservation {
            screenshot_path: PathBuf::from(&step_folder).join("screenshot.png"),
            layout_path: PathBuf::from(&step_folder).join("layout.xml"),
            simplified_layout_path: PathBuf::from(&step_folder).join("simplified_layout.txt"),
            element_count: obs.elements.len(),
        });

        let trace_step = TraceStep {
            step: record.step,
            timestamp: record.timestamp,
            duration_ms: record.duration_ms,
            observation,
            exchanges: record.exchanges.clone(),
            decision: record.decision.clone(),
            outcome: record.outcome.clone(),
            tokens: record.tokens,
        };

        let write_result = write_step_files(&step_dir, &record, &trace_step);
        self.trace.push(trace_step);
        write_result
    }

    /// Close the run: write `summary.json` and `execution_trace.json` and
    /// return the derived [`RunSummary`]. Consuming `self` makes a second
    /// finalize unrepresentable.
    pub fn finalize(self, status: TerminalStatus, summary_text: impl Into<String>) -> RunSummary {
        let ended_at = Utc::now();
        let duration = ended_at - self.started_at;
        let summary = RunSummary {
            task: self.task,
            device_id: self.device_id,
            run_start_time: self.started_at,
            run_end_time: ended_at,
            duration_seconds: (duration.num_milliseconds() as f64 / 1000.0 * 100.0).round() / 100.0,
            final_status: status,
            total_steps: self.last_step,
            token_usage: self.tokens,
            summary_text: summary_text.into(),
        };

        if let Err(e) = write_json(&self.run_dir.join("summary.json"), &summary) {
            error!(error = %e, "failed to write run summary");
        }

        let trace_doc = serde_json::json!({
            "metadata": summary,
            "trace": self.trace,
        });
        if let Err(e) = write_json(&self.run_dir.join("execution_trace.json"), &trace_doc) {
            error!(error = %e, "failed to write execution trace");
        }

        info!(
            status = %summary.final_status,
            steps = summary.total_steps,
            "run finalized"
        );
        summary
    }
}

fn write_step_files(
    step_dir: &Path,
    record: &StepRecord,
    trace_step: &TraceStep,
) -> std::io::Result<()> {
    fs::create_dir_all(step_dir)?;
    if let Some(obs) = &record.observation {
        if !obs.screenshot.is_empty() {
            fs::write(step_dir.join("screenshot.png"), &obs.screenshot)?;
        }
        if !obs.layout_xml.is_empty() {
            fs::write(step_dir.join("layout.xml"), &obs.layout_xml)?;
        }
        if !obs.listing.is_empty() {
            fs::write(step_dir.join("simplified_layout.txt"), &obs.listing)?;
        }
    }
    write_json(&step_dir.join("step_details.json"), trace_step)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    fs::write(path, text)
}

/// Sanitize a name for use in directory names
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::Observation;
    use pretty_assertions::assert_eq;

    fn observation() -> Observation {
        Observation {
            screenshot: vec![0x89, 0x50, 0x4E, 0x47],
            layout_xml: "<hierarchy/>".to_string(),
            elements: vec![],
            listing: "[1] Button {}\n".to_string(),
        }
    }

    fn record(step: u32) -> StepRecord {
        StepRecord {
            step,
            timestamp: Utc::now(),
            duration_ms: 12,
            observation: Some(observation()),
            exchanges: vec![ExchangeRecord {
                attempt: 1,
                prompt: "p".to_string(),
                response: Some("r".to_string()),
                error: None,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            }],
            decision: None,
            outcome: ExecutionOutcome::Executed,
            tokens: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        }
    }

    #[test]
    fn test_records_steps_and_files_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = InfoPool::create(tmp.path(), "send an email", "emulator-5554").unwrap();
        pool.record_step(record(1)).unwrap();
        pool.record_step(record(2)).unwrap();
        assert_eq!(pool.step_count(), 2);

        let step1 = pool.run_dir().join("step_001");
        assert!(step1.join("screenshot.png").exists());
        assert!(step1.join("layout.xml").exists());
        assert!(step1.join("simplified_layout.txt").exists());
        assert!(step1.join("step_details.json").exists());
        assert!(pool.run_dir().join("step_002").exists());
    }

    #[test]
    #[should_panic(expected = "appended in order")]
    fn test_duplicate_step_number_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = InfoPool::create(tmp.path(), "t", "d").unwrap();
        pool.record_step(record(1)).unwrap();
        pool.record_step(record(1)).unwrap();
    }

    #[test]
    #[should_panic(expected = "appended in order")]
    fn test_step_gap_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = InfoPool::create(tmp.path(), "t", "d").unwrap();
        pool.record_step(record(2)).unwrap();
    }

    #[test]
    fn test_finalize_aggregates_and_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = InfoPool::create(tmp.path(), "check weather", "serial-1").unwrap();
        let run_dir = pool.run_dir().to_path_buf();
        pool.record_step(record(1)).unwrap();
        pool.record_step(record(2)).unwrap();

        let summary = pool.finalize(TerminalStatus::Completed, "weather shown");
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.final_status, TerminalStatus::Completed);
        assert_eq!(summary.token_usage.total_tokens, 30);
        assert_eq!(summary.task, "check weather");

        let summary_json = std::fs::read_to_string(run_dir.join("summary.json")).unwrap();
        let parsed: RunSummary = serde_json::from_str(&summary_json).unwrap();
        assert_eq!(parsed, summary);

        let trace_json = std::fs::read_to_string(run_dir.join("execution_trace.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&trace_json).unwrap();
        assert_eq!(doc["trace"].as_array().unwrap().len(), 2);
        assert_eq!(
            doc["trace"][0]["observation"]["screenshot_path"],
            "step_001/screenshot.png"
        );
    }

    #[test]
    fn test_run_dir_name_is_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = InfoPool::create(tmp.path(), "open http://x.y?z=1", "host:5555").unwrap();
        let name = pool.run_dir().file_name().unwrap().to_string_lossy().to_string();
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
        assert!(!name.contains('?'));
    }
}
