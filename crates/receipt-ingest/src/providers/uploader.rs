//! File storage upload collaborator

use async_trait::async_trait;

use crate::error::Result;
use crate::types::FileRef;

/// Trait for putting a file into durable storage
///
/// Implementations:
/// - `LocalUploader`: content-addressed copy into a local directory
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Store the file and return its URL
    ///
    /// `progress` receives the uploaded fraction (0.0..=1.0) as it advances.
    async fn put(&self, file: &FileRef, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
