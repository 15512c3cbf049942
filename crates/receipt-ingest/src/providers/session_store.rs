//! Session metrics persistence collaborator

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BatchSummary;

/// Trait for recording finished batch sessions
///
/// Implementations:
/// - `ReceiptDb`: SQLite `sessions` table
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, summary: &BatchSummary) -> Result<()>;

    /// Most recent sessions first
    async fn list_sessions(&self, limit: usize) -> Result<Vec<BatchSummary>>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
