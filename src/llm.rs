//! Chat-completions client with streaming support.
//!
//! Provides robust provider communication for the control loop:
//! - Streaming responses (no total timeout, activity-based timeout)
//! - Non-streaming fallback for endpoints without SSE support
//! - Connection health checks
//! - Token usage accounting per call
//! - A process-wide minimum-interval gate so concurrent device loops
//!   throttle provider calls without blocking each other for a call's
//!   duration
//!
//! # Configuration
//!
//! Provider settings can be configured via environment variables:
//! - `DROID_PILOT_LLM_ENDPOINT`: chat-completions endpoint URL
//! - `DROID_PILOT_LLM_MODEL`: model name
//! - `DROID_PILOT_LLM_MAX_TOKENS`: max tokens in response
//! - `DROID_PILOT_LLM_TIMEOUT`: activity timeout (seconds)
//! - `DROID_PILOT_LLM_CONNECT_TIMEOUT`: connection timeout (seconds)
//! - `DROID_PILOT_LLM_MIN_INTERVAL_MS`: minimum interval between calls

use base64::Engine;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config;

/// Result type for provider operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors that can occur during provider operations
#[derive(Debug)]
pub enum LlmError {
    /// Failed to connect to the endpoint
    ConnectionFailed(String),
    /// No activity for too long during streaming
    ActivityTimeout(Duration),
    /// Response body could not be understood
    InvalidResponse(String),
    /// The provider rejected the credentials; never retried
    Auth(String),
    /// IO error
    Io(std::io::Error),
}

impl LlmError {
    /// Fatal errors abort the run; everything else is retryable within the
    /// step's attempt budget.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LlmError::Auth(_))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            LlmError::ActivityTimeout(d) => write!(f, "No response for {:?}", d),
            LlmError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            LlmError::Auth(msg) => write!(f, "Authentication rejected: {}", msg),
            LlmError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<std::io::Error> for LlmError {
    fn from(e: std::io::Error) -> Self {
        LlmError::Io(e)
    }
}

/// Token counts reported by the provider for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fold another call's usage into this accumulator
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Raw provider answer: response text plus usage accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Configuration for the chat client
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Chat-completions endpoint URL
    pub endpoint: String,
    /// Model name to use
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Timeout for initial connection (seconds)
    pub connection_timeout: u64,
    /// Timeout for inactivity during streaming (seconds)
    pub activity_timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            endpoint: cfg.llm.endpoint.clone(),
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            temperature: cfg.llm.temperature,
            connection_timeout: cfg.llm.connect_timeout,
            activity_timeout: cfg.llm.activity_timeout,
        }
    }
}

impl LlmConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn activity_timeout(mut self, seconds: u64) -> Self {
        self.activity_timeout = seconds;
        self
    }
}

// ============================================================================
// Rate gate
// ============================================================================

static LAST_CALL: Lazy<Mutex<Option<Instant>>> = Lazy::new(|| Mutex::new(None));

/// Delay until at least the configured interval has passed since the previous
/// provider call started. The lock covers only the bookkeeping, never the
/// call itself, so one device's slow request cannot stall the others.
fn rate_gate() {
    let min_interval = Duration::from_millis(config::get().llm.min_interval_ms);
    if min_interval.is_zero() {
        return;
    }
    loop {
        let wait = {
            let mut last = LAST_CALL.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match *last {
                Some(prev) if now.duration_since(prev) < min_interval => {
                    min_interval - now.duration_since(prev)
                }
                _ => {
                    *last = Some(now);
                    return;
                }
            }
        };
        thread::sleep(wait);
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Check if the endpoint is reachable (connection-only check).
///
/// This only verifies the server accepts connections - it doesn't wait for a
/// full response since a real completion can take tens of seconds.
pub fn check_health(endpoint: &str, timeout_secs: u64) -> LlmResult<bool> {
    let url = endpoint.trim_start_matches("http://").trim_start_matches("https://");
    let host_port = url.split('/').next().unwrap_or("127.0.0.1:8080");

    let output = Command::new("curl")
        .args([
            "-s",
            "-o", "/dev/null",
            "-w", "%{http_code}",
            "--connect-timeout", &timeout_secs.to_string(),
            "--max-time", &timeout_secs.to_string(),
            "-I",
            &format!("http://{}", host_port),
        ])
        .output()?;

    let status = String::from_utf8_lossy(&output.stdout);
    // Any response (even 4xx/5xx) means the server is reachable;
    // 000 means the connection failed entirely.
    let code: u16 = status.trim().parse().unwrap_or(0);
    Ok(code > 0)
}

fn build_request(
    config: &LlmConfig,
    prompt: &str,
    images: &[Vec<u8>],
    stream: bool,
) -> serde_json::Value {
    let mut content = Vec::new();
    for image in images {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        content.push(serde_json::json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:image/png;base64,{}", encoded)
            }
        }));
    }
    content.push(serde_json::json!({
        "type": "text",
        "text": prompt
    }));

    let mut request = serde_json::json!({
        "model": config.model,
        "messages": [
            {
                "role": "system",
                "content": crate::prompt::SYSTEM_PROMPT
            },
            {
                "role": "user",
                "content": content
            }
        ],
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "stream": stream
    });
    if stream {
        request["stream_options"] = serde_json::json!({"include_usage": true});
    }
    request
}

/// Inspect a provider error body and split fatal credential problems from
/// retryable transport/provider faults.
fn classify_error_body(body: &serde_json::Value) -> Option<LlmError> {
    let error = body.get("error")?;
    let message = error["message"].as_str().unwrap_or("provider error").to_string();
    let kind = error["type"]
        .as_str()
        .or_else(|| error["code"].as_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if kind.contains("auth") || kind.contains("api_key") || kind.contains("permission") {
        Some(LlmError::Auth(message))
    } else {
        Some(LlmError::ConnectionFailed(message))
    }
}

/// Ask the model for the next step, streaming to avoid silent hangs.
///
/// `images` are PNG screenshots attached before the text, oldest first. The
/// call blocks until the provider finishes, errors, or goes quiet for longer
/// than the activity timeout.
pub fn complete(config: &LlmConfig, prompt: &str, images: &[Vec<u8>]) -> LlmResult<InferenceReply> {
    rate_gate();

    let request = build_request(config, prompt, images, true);
    let request_json =
        serde_json::to_string(&request).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    // Spawn curl with streaming
    let mut child = Command::new("curl")
        .args([
            "-s",
            "-N", // Disable buffering for streaming
            "-X", "POST",
            &config.endpoint,
            "-H", "Content-Type: application/json",
            "-d", &request_json,
            "--connect-timeout", &config.connection_timeout.to_string(),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LlmError::Io(std::io::Error::other("Failed to capture stdout")))?;

    // Read streaming response with activity timeout
    let (tx, rx) = mpsc::channel();
    let activity_timeout = Duration::from_secs(config.activity_timeout);

    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(Ok(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });

    let mut full_content = String::new();
    let mut usage = TokenUsage::default();
    let mut last_activity = Instant::now();

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(line)) => {
                last_activity = Instant::now();

                // Parse SSE data
                if let Some(data) = line.strip_prefix("data: ") {
                    if data == "[DONE]" {
                        break;
                    }

                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                        if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
                            full_content.push_str(content);
                        }
                        // The usage chunk arrives last, with an empty choices array.
                        if let Ok(u) =
                            serde_json::from_value::<TokenUsage>(json["usage"].clone())
                        {
                            if u.total_tokens > 0 {
                                usage = u;
                            }
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                return Err(LlmError::Io(e));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if last_activity.elapsed() > activity_timeout {
                    let _ = child.kill();
                    return Err(LlmError::ActivityTimeout(activity_timeout));
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break;
            }
        }
    }

    let status = child.wait()?;

    if !status.success() && full_content.is_empty() {
        return Err(LlmError::ConnectionFailed("curl process failed".to_string()));
    }

    // If streaming didn't work (no SSE data, or a plain error body), try the
    // non-streaming endpoint shape once.
    if full_content.is_empty() {
        debug!("streaming produced no content, falling back to non-streaming");
        return complete_non_streaming(config, prompt, images);
    }

    Ok(InferenceReply {
        text: full_content,
        usage,
    })
}

/// Fallback non-streaming completion (for APIs that don't support streaming)
pub fn complete_non_streaming(
    config: &LlmConfig,
    prompt: &str,
    images: &[Vec<u8>],
) -> LlmResult<InferenceReply> {
    let request = build_request(config, prompt, images, false);
    let request_json =
        serde_json::to_string(&request).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    // A generous fixed ceiling stands in for the activity timeout here, since
    // a buffered response gives nothing to watch until it completes.
    let max_time = config.activity_timeout.saturating_mul(2).max(30);
    let output = Command::new("curl")
        .args([
            "-s",
            "-X", "POST",
            &config.endpoint,
            "-H", "Content-Type: application/json",
            "-d", &request_json,
            "--connect-timeout", &config.connection_timeout.to_string(),
            "--max-time", &max_time.to_string(),
        ])
        .output()?;

    if !output.status.success() {
        return Err(LlmError::ConnectionFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let response: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    if let Some(err) = classify_error_body(&response) {
        warn!(error = %err, "provider returned an error body");
        return Err(err);
    }

    let content = response["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("");
    if content.is_empty() {
        return Err(LlmError::InvalidResponse(
            "response carried no message content".to_string(),
        ));
    }

    let usage = serde_json::from_value::<TokenUsage>(response["usage"].clone())
        .unwrap_or_default();

    Ok(InferenceReply {
        text: content.to_string(),
        usage,
    })
}

/// Provider client behind the loop's [`Inference`](crate::agent::Inference)
/// seam
#[derive(Debug, Clone, Default)]
pub struct ChatClient {
    config: LlmConfig,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

impl crate::agent::types::Inference for ChatClient {
    fn infer(&mut self, prompt: &str, images: &[Vec<u8>]) -> LlmResult<InferenceReply> {
        complete(&self.config, prompt, images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_config_builder() {
        let config = LlmConfig::new("http://localhost:8080")
            .model("llava")
            .max_tokens(200)
            .activity_timeout(30);

        assert_eq!(config.endpoint, "http://localhost:8080");
        assert_eq!(config.model, "llava");
        assert_eq!(config.max_tokens, 200);
        assert_eq!(config.activity_timeout, 30);
    }

    #[test]
    fn test_token_usage_accumulate() {
        let mut total = TokenUsage::default();
        total.accumulate(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn test_build_request_shape() {
        let config = LlmConfig {
            endpoint: "http://x".to_string(),
            model: "m".to_string(),
            max_tokens: 64,
            temperature: 0.1,
            connection_timeout: 1,
            activity_timeout: 1,
        };
        let req = build_request(&config, "do it", &[vec![1, 2, 3]], true);
        assert_eq!(req["model"], "m");
        assert_eq!(req["stream"], true);
        assert_eq!(req["messages"][0]["role"], "system");
        // Image payload precedes the text block.
        assert_eq!(req["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(req["messages"][1]["content"][1]["text"], "do it");

        let plain = build_request(&config, "do it", &[], false);
        assert_eq!(plain["messages"][1]["content"][0]["type"], "text");
        assert!(plain.get("stream_options").is_none());
    }

    #[test]
    fn test_classify_error_body() {
        let auth: serde_json::Value = serde_json::json!({
            "error": {"message": "bad key", "type": "invalid_api_key_error"}
        });
        assert!(matches!(
            classify_error_body(&auth),
            Some(LlmError::Auth(_))
        ));

        let transient: serde_json::Value = serde_json::json!({
            "error": {"message": "overloaded", "type": "server_error"}
        });
        assert!(matches!(
            classify_error_body(&transient),
            Some(LlmError::ConnectionFailed(_))
        ));

        let ok: serde_json::Value = serde_json::json!({"choices": []});
        assert!(classify_error_body(&ok).is_none());
    }

    #[test]
    fn test_auth_errors_are_fatal() {
        assert!(LlmError::Auth("x".to_string()).is_fatal());
        assert!(!LlmError::ConnectionFailed("x".to_string()).is_fatal());
        assert!(!LlmError::ActivityTimeout(Duration::from_secs(1)).is_fatal());
    }
}
