//! AI extraction collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{RecordId, TokenUsage};

/// Processing status of an extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Accepted; the result will arrive through status push
    Queued,
    Processing,
    Completed { data: serde_json::Value },
    Failed { reason: String },
}

impl ExtractionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExtractionStatus::Completed { .. } | ExtractionStatus::Failed { .. }
        )
    }
}

/// Direct return of an extraction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub status: ExtractionStatus,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Trait for AI field extraction from a stored receipt
///
/// Implementations:
/// - `OllamaExtractor`: local vision model through the Ollama API
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Run (or enqueue) extraction for a record
    ///
    /// Returns `Error::RateLimited` when the remote API refuses the call.
    async fn process(&self, record_id: &RecordId, model_hint: &str) -> Result<ExtractionOutcome>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
