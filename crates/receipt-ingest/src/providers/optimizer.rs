//! Best-effort file optimization collaborator

use async_trait::async_trait;

use crate::error::Result;
use crate::types::FileRef;

/// Trait for pre-upload transforms such as recompression
///
/// Failures are never fatal: the pipeline falls back to the original file.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn transform(&self, file: &FileRef) -> Result<FileRef>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
