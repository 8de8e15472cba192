//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for droid-pilot, supporting:
//! - Environment variables for all configurable values
//! - Sensible defaults matching the common local setup
//! - Builder-style overrides for programmatic configuration
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DROID_PILOT_LLM_ENDPOINT` | Chat-completions endpoint URL | `http://127.0.0.1:8080/v1/chat/completions` |
//! | `DROID_PILOT_LLM_MODEL` | Model name | `qwen3` |
//! | `DROID_PILOT_LLM_MAX_TOKENS` | Maximum tokens per response | `1024` |
//! | `DROID_PILOT_LLM_TIMEOUT` | Activity timeout during streaming (seconds) | `120` |
//! | `DROID_PILOT_LLM_CONNECT_TIMEOUT` | Connection timeout (seconds) | `10` |
//! | `DROID_PILOT_LLM_MIN_INTERVAL_MS` | Minimum interval between provider calls (ms, 0 = off) | `0` |
//! | `DROID_PILOT_ADB_PATH` | Path to the adb executable | `adb` |
//! | `DROID_PILOT_ADB_TIMEOUT` | Timeout for adb commands (seconds) | `20` |
//! | `DROID_PILOT_MAX_STEPS` | Maximum steps per run | `15` |
//! | `DROID_PILOT_RETRY_ATTEMPTS` | Per-step attempt budget | `3` |
//! | `DROID_PILOT_RUNS_DIR` | Base directory for run output | `runs` |
//!
//! # Example
//!
//! ```bash
//! # Point at a different provider
//! export DROID_PILOT_LLM_ENDPOINT="http://localhost:11434/v1/chat/completions"
//! export DROID_PILOT_LLM_MODEL="llava"
//! ```

use std::env;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default chat-completions endpoint
pub const DEFAULT_LLM_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";

/// Default model name
pub const DEFAULT_LLM_MODEL: &str = "qwen3";

/// Default max tokens per response
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 1024;

/// Default sampling temperature
pub const DEFAULT_LLM_TEMPERATURE: f32 = 0.1;

/// Default connection timeout (seconds)
pub const DEFAULT_LLM_CONNECT_TIMEOUT: u64 = 10;

/// Default activity timeout (seconds)
pub const DEFAULT_LLM_ACTIVITY_TIMEOUT: u64 = 120;

/// Default minimum interval between provider calls (milliseconds, 0 disables)
pub const DEFAULT_LLM_MIN_INTERVAL_MS: u64 = 0;

/// Default adb executable
pub const DEFAULT_ADB_PATH: &str = "adb";

/// Default adb command timeout (seconds)
pub const DEFAULT_ADB_TIMEOUT: u64 = 20;

/// Default maximum steps per run
pub const DEFAULT_MAX_STEPS: u32 = 15;

/// Default per-step attempt budget
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between steps (milliseconds)
pub const DEFAULT_STEP_DELAY_MS: u64 = 1000;

/// Default history window carried into follow-up prompts
pub const DEFAULT_HISTORY_WINDOW: usize = 4;

/// Default screenshot downscale factor (1.0 disables)
pub const DEFAULT_IMAGE_SCALE: f32 = 1.0;

/// Default base directory for run output
pub const DEFAULT_RUNS_DIR: &str = "runs";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the chat-completions endpoint
pub const ENV_LLM_ENDPOINT: &str = "DROID_PILOT_LLM_ENDPOINT";

/// Environment variable for the model name
pub const ENV_LLM_MODEL: &str = "DROID_PILOT_LLM_MODEL";

/// Environment variable for max tokens
pub const ENV_LLM_MAX_TOKENS: &str = "DROID_PILOT_LLM_MAX_TOKENS";

/// Environment variable for the connection timeout
pub const ENV_LLM_CONNECT_TIMEOUT: &str = "DROID_PILOT_LLM_CONNECT_TIMEOUT";

/// Environment variable for the activity timeout
pub const ENV_LLM_ACTIVITY_TIMEOUT: &str = "DROID_PILOT_LLM_TIMEOUT";

/// Environment variable for the provider call interval
pub const ENV_LLM_MIN_INTERVAL_MS: &str = "DROID_PILOT_LLM_MIN_INTERVAL_MS";

/// Environment variable for the adb executable path
pub const ENV_ADB_PATH: &str = "DROID_PILOT_ADB_PATH";

/// Environment variable for the adb command timeout
pub const ENV_ADB_TIMEOUT: &str = "DROID_PILOT_ADB_TIMEOUT";

/// Environment variable for the step limit
pub const ENV_MAX_STEPS: &str = "DROID_PILOT_MAX_STEPS";

/// Environment variable for the per-step attempt budget
pub const ENV_RETRY_ATTEMPTS: &str = "DROID_PILOT_RETRY_ATTEMPTS";

/// Environment variable for the runs directory
pub const ENV_RUNS_DIR: &str = "DROID_PILOT_RUNS_DIR";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for droid-pilot
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider configuration
    pub llm: LlmSettings,
    /// Device bridge configuration
    pub adb: AdbSettings,
    /// Step loop configuration
    pub agent: AgentSettings,
    /// Run output configuration
    pub runs: RunSettings,
}

/// Provider-related settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Chat-completions endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Activity timeout during streaming (seconds)
    pub activity_timeout: u64,
    /// Minimum interval between provider calls (milliseconds, 0 disables)
    pub min_interval_ms: u64,
}

/// Device-bridge settings
#[derive(Debug, Clone)]
pub struct AdbSettings {
    /// Path to the adb executable
    pub executable: String,
    /// Timeout for individual adb commands (seconds)
    pub command_timeout: u64,
}

/// Step-loop settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Maximum steps per run
    pub max_steps: u32,
    /// Whether reasoning faults are retried within a step
    pub retry_enabled: bool,
    /// Per-step attempt budget (used when retry is enabled)
    pub retry_attempts: u32,
    /// Whether malformed JSON responses go through repair before failing
    pub repair_enabled: bool,
    /// Whether screenshots are attached to prompts
    pub vision_enabled: bool,
    /// Number of prior steps summarized in follow-up prompts
    pub history_window: usize,
    /// Delay between steps (milliseconds)
    pub step_delay_ms: u64,
    /// Screenshot downscale factor before prompt attachment (1.0 disables)
    pub image_scale: f32,
}

/// Run output settings
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Base directory where run directories are created
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            llm: LlmSettings::from_env(),
            adb: AdbSettings::from_env(),
            agent: AgentSettings::from_env(),
            runs: RunSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            llm: LlmSettings::defaults(),
            adb: AdbSettings::defaults(),
            agent: AgentSettings::defaults(),
            runs: RunSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

impl LlmSettings {
    /// Create provider settings from environment variables
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_LLM_ENDPOINT).unwrap_or_else(|_| DEFAULT_LLM_ENDPOINT.to_string()),
            model: env::var(ENV_LLM_MODEL).unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            max_tokens: env_parsed(ENV_LLM_MAX_TOKENS, DEFAULT_LLM_MAX_TOKENS),
            temperature: DEFAULT_LLM_TEMPERATURE,
            connect_timeout: env_parsed(ENV_LLM_CONNECT_TIMEOUT, DEFAULT_LLM_CONNECT_TIMEOUT),
            activity_timeout: env_parsed(ENV_LLM_ACTIVITY_TIMEOUT, DEFAULT_LLM_ACTIVITY_TIMEOUT),
            min_interval_ms: env_parsed(ENV_LLM_MIN_INTERVAL_MS, DEFAULT_LLM_MIN_INTERVAL_MS),
        }
    }

    /// Create provider settings with defaults
    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            max_tokens: DEFAULT_LLM_MAX_TOKENS,
            temperature: DEFAULT_LLM_TEMPERATURE,
            connect_timeout: DEFAULT_LLM_CONNECT_TIMEOUT,
            activity_timeout: DEFAULT_LLM_ACTIVITY_TIMEOUT,
            min_interval_ms: DEFAULT_LLM_MIN_INTERVAL_MS,
        }
    }
}

impl AdbSettings {
    /// Create device-bridge settings from environment variables
    pub fn from_env() -> Self {
        Self {
            executable: env::var(ENV_ADB_PATH).unwrap_or_else(|_| DEFAULT_ADB_PATH.to_string()),
            command_timeout: env_parsed(ENV_ADB_TIMEOUT, DEFAULT_ADB_TIMEOUT),
        }
    }

    /// Create device-bridge settings with defaults
    pub fn defaults() -> Self {
        Self {
            executable: DEFAULT_ADB_PATH.to_string(),
            command_timeout: DEFAULT_ADB_TIMEOUT,
        }
    }
}

impl AgentSettings {
    /// Create step-loop settings from environment variables
    pub fn from_env() -> Self {
        Self {
            max_steps: env_parsed(ENV_MAX_STEPS, DEFAULT_MAX_STEPS),
            retry_attempts: env_parsed(ENV_RETRY_ATTEMPTS, DEFAULT_RETRY_ATTEMPTS),
            ..Self::defaults()
        }
    }

    /// Create step-loop settings with defaults
    pub fn defaults() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            retry_enabled: true,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            repair_enabled: true,
            vision_enabled: true,
            history_window: DEFAULT_HISTORY_WINDOW,
            step_delay_ms: DEFAULT_STEP_DELAY_MS,
            image_scale: DEFAULT_IMAGE_SCALE,
        }
    }
}

impl RunSettings {
    /// Create run output settings from environment variables
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_RUNS_DIR).unwrap_or_else(|_| DEFAULT_RUNS_DIR.to_string()),
        }
    }

    /// Create run output settings with defaults
    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_RUNS_DIR.to_string(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Get the chat-completions endpoint (convenience function)
pub fn llm_endpoint() -> String {
    get().llm.endpoint.clone()
}

/// Get the model name (convenience function)
pub fn llm_model() -> String {
    get().llm.model.clone()
}

/// Get the adb executable path (convenience function)
pub fn adb_path() -> String {
    get().adb.executable.clone()
}

/// Get the base directory for run output (convenience function)
pub fn runs_base_dir() -> String {
    get().runs.base_dir.clone()
}
