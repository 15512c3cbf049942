//! Progress and metrics types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobId, Stage};

/// One progress report from a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,
    /// Overall job percent (0..=100)
    pub percent: f32,
    pub timestamp: DateTime<Utc>,
}

/// Token usage reported by the extraction API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Aggregate batch progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub total_files: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
    pub pending: usize,
    /// Mean per-job percent; completed counts 100, failed counts 0
    pub percent: f32,
    pub throughput_per_minute: f64,
    /// `None` while throughput is zero
    pub eta_seconds: Option<f64>,
    pub api_calls_total: u64,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    /// Failure share of the most recent terminal jobs
    pub error_rate: f64,
    pub rate_limit_events: u64,
}

impl ProgressMetrics {
    /// ETA formatted for display
    pub fn eta_display(&self) -> String {
        match self.eta_seconds {
            Some(secs) if secs.is_finite() => {
                let secs = secs.round() as u64;
                if secs >= 60 {
                    format!("{}m {}s", secs / 60, secs % 60)
                } else {
                    format!("{}s", secs)
                }
            }
            _ => "unknown".to_string(),
        }
    }
}

/// Advisory alerts about degraded batch conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    HighErrorRate { error_rate: f64, window: usize },
    RepeatedRateLimiting { events: usize, window_secs: u64 },
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alert::HighErrorRate { error_rate, window } => write!(
                f,
                "error rate {:.0}% over the last {} jobs",
                error_rate * 100.0,
                window
            ),
            Alert::RepeatedRateLimiting { events, window_secs } => write!(
                f,
                "{} rate-limit events in the last {}s",
                events, window_secs
            ),
        }
    }
}
