//! Configuration for the ingestion system

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable pointing at a TOML config file
pub const CONFIG_ENV_VAR: &str = "RECEIPT_INGEST_CONFIG";

/// Longest accepted delay, timeout or window (one week)
pub const MAX_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Scheduler-level retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-job pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// External API budget
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Progress aggregation and alerting
    #[serde(default)]
    pub progress: ProgressConfig,
    /// File admission rules
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Local storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ollama extraction backend
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: IngestConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `RECEIPT_INGEST_CONFIG` if set, defaults otherwise
    pub fn from_env_or_default() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                Self::from_file(PathBuf::from(path))
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::Config("scheduler.max_concurrent must be > 0".into()));
        }
        if self.pipeline.stage_attempts == 0 {
            return Err(Error::Config("pipeline.stage_attempts must be > 0".into()));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(Error::Config("rate_limit.window_ms must be > 0".into()));
        }
        let multipliers = [self.rate_limit.backoff_multiplier, self.retry.multiplier];
        if multipliers.iter().any(|m| !m.is_finite() || *m < 1.0) {
            return Err(Error::Config("backoff multipliers must be finite and >= 1.0".into()));
        }
        let durations = [
            ("retry.base_delay_ms", self.retry.base_delay_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
            ("pipeline.stage_backoff_ms", self.pipeline.stage_backoff_ms),
            ("pipeline.extract_timeout_ms", self.pipeline.extract_timeout_ms),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("rate_limit.max_wait_ms", self.rate_limit.max_wait_ms),
            ("rate_limit.initial_backoff_ms", self.rate_limit.initial_backoff_ms),
            ("rate_limit.max_backoff_ms", self.rate_limit.max_backoff_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms > MAX_DURATION_MS) {
            return Err(Error::Config(format!("{} must be <= {} ms", name, MAX_DURATION_MS)));
        }
        if self.progress.smoothing_ticks == 0 {
            return Err(Error::Config("progress.smoothing_ticks must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.progress.error_rate_threshold) {
            return Err(Error::Config(
                "progress.error_rate_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs in flight (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum admissions of one file, original included (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Interval between progress smoothing ticks in milliseconds (default: 100)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_max_concurrent() -> usize { 3 }
fn default_max_retries() -> u32 { 3 }
fn default_tick_interval_ms() -> u64 { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Scheduler-level retry delay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first re-admission in milliseconds (default: 1000)
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for the delay in milliseconds (default: 30000)
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    /// Exponential growth factor (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_retry_base_ms() -> u64 { 1_000 }
fn default_retry_max_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Pipeline stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempts for the upload and persist stages (default: 3)
    #[serde(default = "default_stage_attempts")]
    pub stage_attempts: u32,
    /// Linear backoff unit between stage attempts in milliseconds (default: 1000)
    #[serde(default = "default_stage_backoff_ms")]
    pub stage_backoff_ms: u64,
    /// Upper bound on waiting for extraction to finish in milliseconds (default: 300000)
    #[serde(default = "default_extract_timeout_ms")]
    pub extract_timeout_ms: u64,
    /// Token estimate charged against the budget per extraction (default: 1500)
    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens_per_job: u32,
    /// Model hint passed to the extractor
    #[serde(default = "default_model_hint")]
    pub model_hint: String,
}

fn default_stage_attempts() -> u32 { 3 }
fn default_stage_backoff_ms() -> u64 { 1_000 }
fn default_extract_timeout_ms() -> u64 { 300_000 }
fn default_estimated_tokens() -> u32 { 1_500 }
fn default_model_hint() -> String { "llama3.2-vision".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_attempts: default_stage_attempts(),
            stage_backoff_ms: default_stage_backoff_ms(),
            extract_timeout_ms: default_extract_timeout_ms(),
            estimated_tokens_per_job: default_estimated_tokens(),
            model_hint: default_model_hint(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_backoff(&self) -> Duration {
        Duration::from_millis(self.stage_backoff_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }
}

/// External API budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window (default: 50)
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Tokens allowed per window (default: 100_000)
    #[serde(default = "default_tokens_per_window")]
    pub tokens_per_window: u32,
    /// Rolling window length in milliseconds (default: 60000)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Longest a caller sleeps before asking again in milliseconds (default: 60000)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Backoff applied on the first 429 in milliseconds (default: 1000)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds (default: 60000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor for repeated 429s (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_requests_per_window() -> u32 { 50 }
fn default_tokens_per_window() -> u32 { 100_000 }
fn default_window_ms() -> u64 { 60_000 }
fn default_max_wait_ms() -> u64 { 60_000 }
fn default_initial_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 60_000 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            tokens_per_window: default_tokens_per_window(),
            window_ms: default_window_ms(),
            max_wait_ms: default_max_wait_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_multiplier(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Progress aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Ticks used to animate a per-job jump to its new target (default: 8)
    #[serde(default = "default_smoothing_ticks")]
    pub smoothing_ticks: u32,
    /// Sliding window for throughput in seconds (default: 300)
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    /// Number of most recent terminal jobs used for the error rate (default: 20)
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    /// Minimum terminal jobs before an error-rate alert fires (default: 5)
    #[serde(default = "default_error_min_samples")]
    pub error_min_samples: usize,
    /// Error rate that triggers an alert (default: 0.3)
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Rate-limit events within the window that trigger an alert (default: 3)
    #[serde(default = "default_rate_limit_alert_threshold")]
    pub rate_limit_alert_threshold: usize,
    /// Window for counting rate-limit events in seconds (default: 60)
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Cost per 1000 tokens in USD (default: 0.002)
    #[serde(default = "default_cost_per_1k_tokens")]
    pub cost_per_1k_tokens: f64,
    /// Flat cost per API call in USD (default: 0.0)
    #[serde(default)]
    pub cost_per_call: f64,
}

fn default_smoothing_ticks() -> u32 { 8 }
fn default_throughput_window_secs() -> u64 { 300 }
fn default_error_window() -> usize { 20 }
fn default_error_min_samples() -> usize { 5 }
fn default_error_rate_threshold() -> f64 { 0.3 }
fn default_rate_limit_alert_threshold() -> usize { 3 }
fn default_rate_limit_window_secs() -> u64 { 60 }
fn default_cost_per_1k_tokens() -> f64 { 0.002 }

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            smoothing_ticks: default_smoothing_ticks(),
            throughput_window_secs: default_throughput_window_secs(),
            error_window: default_error_window(),
            error_min_samples: default_error_min_samples(),
            error_rate_threshold: default_error_rate_threshold(),
            rate_limit_alert_threshold: default_rate_limit_alert_threshold(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            cost_per_1k_tokens: default_cost_per_1k_tokens(),
            cost_per_call: 0.0,
        }
    }
}

/// File admission rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum size of one file in bytes (default: 20MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum number of files in one enqueue call (default: 100)
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    /// Maximum combined size of one enqueue call in bytes (default: 500MB)
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    /// Accepted file extensions
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_file_size() -> u64 { 20 * 1024 * 1024 }         // 20MB
fn default_max_files_per_batch() -> usize { 100 }
fn default_max_batch_bytes() -> u64 { 500 * 1024 * 1024 }      // 500MB
fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp", "heic", "pdf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_files_per_batch: default_max_files_per_batch(),
            max_batch_bytes: default_max_batch_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database for records, sessions and shared quota
    pub database_path: PathBuf,
    /// Directory receiving uploaded files
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use absolute paths so the CLI works from any directory
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
            .join("receipt-ingest");

        Self {
            database_path: base.join("receipts.db"),
            upload_dir: base.join("uploads"),
        }
    }
}

/// Ollama extraction backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Sampling temperature for extraction
    pub temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 120,
            temperature: 0.0, // Deterministic field extraction
        }
    }
}
