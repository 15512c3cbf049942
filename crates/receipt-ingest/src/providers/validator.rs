//! File validation collaborator

use async_trait::async_trait;

use crate::error::Result;
use crate::types::FileRef;

/// Outcome of checking one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Trait for admission-time file checks
///
/// Implementations:
/// - `LocalValidator`: extension allow-list, size limits, magic-byte sniffing
#[async_trait]
pub trait Validator: Send + Sync {
    /// Check an entire admission call against hard quotas
    ///
    /// An error here rejects the whole call.
    async fn check_quota(&self, files: &[FileRef]) -> Result<()>;

    /// Check one file's type and size
    async fn check(&self, file: &FileRef) -> Validation;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
