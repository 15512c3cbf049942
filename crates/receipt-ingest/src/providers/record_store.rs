//! Downstream receipt record collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{JobId, RecordId, RiskLevel};

/// Metadata for a new receipt record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub job_id: JobId,
    pub original_job_id: JobId,
    pub filename: String,
    pub content_hash: String,
    pub size_bytes: u64,
    /// Storage URL returned by the uploader
    pub url: String,
    pub content_type: Option<String>,
    pub risk: RiskLevel,
}

/// Trait for the receipt record database
///
/// Calls are idempotent by convention; the pipeline may repeat `create`
/// for the same job when an earlier attempt's response was lost.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record and return its id
    async fn create(&self, meta: &RecordMeta) -> Result<RecordId>;

    /// Flag the record's file as fully uploaded
    async fn mark_uploaded(&self, record_id: &RecordId) -> Result<()>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
