//! Asynchronous extraction status notifications

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::extractor::ExtractionStatus;
use crate::error::Result;
use crate::types::{RecordId, TokenUsage};

/// A pushed status change for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub record_id: RecordId,
    pub status: ExtractionStatus,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Stream of updates for one record; dropping it unsubscribes
pub type StatusStream = BoxStream<'static, StatusUpdate>;

/// Trait for the backend's real-time status channel
///
/// Implementations:
/// - `StatusHub`: in-process broadcast hub
#[async_trait]
pub trait StatusPush: Send + Sync {
    async fn subscribe(&self, record_id: &RecordId) -> Result<StatusStream>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
