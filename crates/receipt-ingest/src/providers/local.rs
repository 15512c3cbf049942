//! Local provider implementations using the filesystem and in-process channels

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::ValidationConfig;
use crate::error::{Error, Result};
use crate::types::{FileRef, RecordId};

use super::optimizer::Optimizer;
use super::status_push::{StatusPush, StatusStream, StatusUpdate};
use super::uploader::Uploader;
use super::validator::{Validation, Validator};

/// Detected container format from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Jpeg,
    Png,
    Webp,
    Heic,
    Pdf,
    Unknown,
}

impl SniffedFormat {
    /// Detect the format from magic bytes
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            SniffedFormat::Jpeg
        } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            SniffedFormat::Png
        } else if data.starts_with(b"%PDF") {
            SniffedFormat::Pdf
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            SniffedFormat::Webp
        } else if data.len() >= 12 && &data[4..8] == b"ftyp" {
            SniffedFormat::Heic
        } else {
            SniffedFormat::Unknown
        }
    }

    /// Whether a file with this extension may hold this format
    fn matches_extension(self, ext: &str) -> bool {
        match self {
            SniffedFormat::Jpeg => matches!(ext, "jpg" | "jpeg"),
            SniffedFormat::Png => ext == "png",
            SniffedFormat::Webp => ext == "webp",
            SniffedFormat::Heic => matches!(ext, "heic" | "heif"),
            SniffedFormat::Pdf => ext == "pdf",
            SniffedFormat::Unknown => false,
        }
    }
}

/// Validator enforcing extension, size and content rules from config
pub struct LocalValidator {
    config: ValidationConfig,
}

impl LocalValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Validator for LocalValidator {
    async fn check_quota(&self, files: &[FileRef]) -> Result<()> {
        if files.len() > self.config.max_files_per_batch {
            return Err(Error::QuotaExceeded(format!(
                "{} files submitted, limit is {}",
                files.len(),
                self.config.max_files_per_batch
            )));
        }
        let total: u64 = files.iter().map(|f| f.size()).sum();
        if total > self.config.max_batch_bytes {
            return Err(Error::QuotaExceeded(format!(
                "{} bytes submitted, limit is {}",
                total, self.config.max_batch_bytes
            )));
        }
        Ok(())
    }

    async fn check(&self, file: &FileRef) -> Validation {
        let ext = file.extension();
        if !self.config.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
            return Validation::Invalid(format!("unsupported file type '.{}'", ext));
        }

        if let Some(mime) = mime_guess::from_ext(&ext).first() {
            if mime.type_() != mime_guess::mime::IMAGE && mime.subtype() != mime_guess::mime::PDF {
                return Validation::Invalid(format!("'{}' is not an image or PDF", mime));
            }
        }

        if file.data.is_empty() {
            return Validation::Invalid("file is empty".to_string());
        }
        if file.size() > self.config.max_file_size {
            return Validation::Invalid(format!(
                "file is {} bytes, limit is {}",
                file.size(),
                self.config.max_file_size
            ));
        }

        let sniffed = SniffedFormat::sniff(&file.data);
        if !sniffed.matches_extension(&ext) {
            return Validation::Invalid(format!(
                "content ({:?}) does not match extension '.{}'",
                sniffed, ext
            ));
        }

        Validation::Valid
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Optimizer that leaves files untouched
pub struct PassthroughOptimizer;

#[async_trait]
impl Optimizer for PassthroughOptimizer {
    async fn transform(&self, file: &FileRef) -> Result<FileRef> {
        Ok(file.clone())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Uploader that copies files into a content-addressed local directory
pub struct LocalUploader {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalUploader {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chunk_size: 64 * 1024,
        }
    }

    /// Destination path for a file: `<root>/<hash[..2]>/<hash>.<ext>`
    pub fn path_for(&self, file: &FileRef) -> PathBuf {
        let hash = file.content_hash();
        let name = match file.extension() {
            ext if ext.is_empty() => hash.clone(),
            ext => format!("{}.{}", hash, ext),
        };
        self.root.join(&hash[..2]).join(name)
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn put(&self, file: &FileRef, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<String> {
        let path = self.path_for(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temp name first so a half-written file is never visible
        let tmp = path.with_extension("part");
        let mut out = tokio::fs::File::create(&tmp).await?;
        let total = file.data.len().max(1);
        let mut written = 0usize;
        for chunk in file.data.chunks(self.chunk_size) {
            out.write_all(chunk).await?;
            written += chunk.len();
            progress(written as f32 / total as f32);
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&tmp, &path).await?;
        progress(1.0);

        tracing::debug!("Stored {} at {}", file.filename, path.display());
        Ok(format!("file://{}", path.display()))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// In-process status push hub
///
/// Backends (or tests) publish updates; pipelines subscribe per record id.
pub struct StatusHub {
    channels: DashMap<RecordId, broadcast::Sender<StatusUpdate>>,
    capacity: usize,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new(32)
    }
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Publish an update; returns how many subscribers received it
    pub fn publish(&self, update: StatusUpdate) -> usize {
        let delivered = match self.channels.get(&update.record_id) {
            Some(sender) => sender.send(update.clone()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Nobody listening any more: drop the channel
            self.channels
                .remove_if(&update.record_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Number of records with live subscribers
    pub fn active_subscriptions(&self) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().receiver_count() > 0)
            .count()
    }
}

#[async_trait]
impl StatusPush for StatusHub {
    async fn subscribe(&self, record_id: &RecordId) -> Result<StatusStream> {
        // Streams of finished jobs are dropped without a final publish
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        let receiver = self
            .channels
            .entry(record_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(update) => Some(update),
                Err(e) => {
                    tracing::warn!("Status push subscriber lagged: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "status-hub"
    }
}
