//! Scripted in-memory collaborators for pipeline and scheduler tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::providers::local::StatusHub;
use crate::providers::{
    Collaborators, ExtractionOutcome, ExtractionStatus, Extractor, Optimizer, RecordMeta,
    RecordStore, StatusUpdate, Uploader, Validation, Validator,
};
use crate::types::{FileRef, RecordId, TokenUsage};

pub const USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 50,
};

/// Rejects files whose name starts with "invalid"
pub struct FakeValidator {
    pub max_files: usize,
}

#[async_trait]
impl Validator for FakeValidator {
    async fn check_quota(&self, files: &[FileRef]) -> Result<()> {
        if files.len() > self.max_files {
            return Err(Error::QuotaExceeded(format!("{} files", files.len())));
        }
        Ok(())
    }

    async fn check(&self, file: &FileRef) -> Validation {
        if file.filename.starts_with("invalid") {
            Validation::Invalid("scripted rejection".into())
        } else {
            Validation::Valid
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
pub struct FakeOptimizer {
    failing: Mutex<bool>,
}

impl FakeOptimizer {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl Optimizer for FakeOptimizer {
    async fn transform(&self, file: &FileRef) -> Result<FileRef> {
        if *self.failing.lock() {
            return Err(Error::internal("optimizer crashed"));
        }
        Ok(file.clone())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Clone, Copy)]
enum UploadScript {
    Transient(u32),
    Permanent,
    Panic,
}

/// Uploader with per-filename scripted failures
#[derive(Default)]
pub struct FakeUploader {
    scripts: Mutex<HashMap<String, UploadScript>>,
    calls: AtomicU32,
    delay: Mutex<Duration>,
}

impl FakeUploader {
    /// Fail the next `times` uploads of `filename` with a transient error
    pub fn fail_transient(&self, filename: &str, times: u32) {
        self.scripts
            .lock()
            .insert(filename.to_string(), UploadScript::Transient(times));
    }

    pub fn fail_permanent(&self, filename: &str) {
        self.scripts
            .lock()
            .insert(filename.to_string(), UploadScript::Permanent);
    }

    pub fn panic_on(&self, filename: &str) {
        self.scripts
            .lock()
            .insert(filename.to_string(), UploadScript::Panic);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn put(&self, file: &FileRef, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        progress(0.5);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&file.filename) {
                Some(UploadScript::Transient(0)) | None => None,
                Some(UploadScript::Transient(n)) => {
                    *n -= 1;
                    Some(UploadScript::Transient(*n))
                }
                Some(other) => Some(*other),
            }
        };
        match script {
            Some(UploadScript::Transient(_)) => Err(Error::transient("connection reset")),
            Some(UploadScript::Permanent) => Err(Error::upload("bucket denied")),
            Some(UploadScript::Panic) => panic!("uploader exploded on {}", file.filename),
            None => {
                progress(1.0);
                Ok(format!("mem://{}", file.filename))
            }
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Record store keeping everything in memory
#[derive(Default)]
pub struct FakeRecordStore {
    created: Mutex<Vec<RecordMeta>>,
    marked: Mutex<Vec<RecordId>>,
    fail_mark: Mutex<bool>,
}

impl FakeRecordStore {
    pub fn set_fail_mark(&self, fail: bool) {
        *self.fail_mark.lock() = fail;
    }

    pub fn created(&self) -> Vec<RecordMeta> {
        self.created.lock().clone()
    }

    pub fn marked(&self) -> Vec<RecordId> {
        self.marked.lock().clone()
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn create(&self, meta: &RecordMeta) -> Result<RecordId> {
        self.created.lock().push(meta.clone());
        Ok(format!("rec-{}", meta.job_id))
    }

    async fn mark_uploaded(&self, record_id: &RecordId) -> Result<()> {
        if *self.fail_mark.lock() {
            return Err(Error::persist("update rejected"));
        }
        self.marked.lock().push(record_id.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// How the fake extractor answers
#[derive(Debug, Clone, Copy)]
pub enum ExtractMode {
    /// Direct return with the completed payload
    Complete,
    /// Direct return `Queued`, completion pushed through the hub later
    QueueThenPush { after: Duration },
    /// Direct return `Queued`, nothing is ever pushed
    QueueOnly,
    /// Remote API answers 429
    RateLimit,
    /// The call never returns
    Hang,
}

pub struct FakeExtractor {
    mode: Mutex<ExtractMode>,
    hub: Arc<StatusHub>,
    calls: AtomicU32,
}

impl FakeExtractor {
    pub fn new(hub: Arc<StatusHub>) -> Self {
        Self {
            mode: Mutex::new(ExtractMode::Complete),
            hub,
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_mode(&self, mode: ExtractMode) {
        *self.mode.lock() = mode;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn completed(record_id: &RecordId) -> ExtractionStatus {
    ExtractionStatus::Completed {
        data: serde_json::json!({ "record": record_id, "total": "12.50" }),
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn process(&self, record_id: &RecordId, _model_hint: &str) -> Result<ExtractionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            ExtractMode::Complete => Ok(ExtractionOutcome {
                status: completed(record_id),
                usage: Some(USAGE),
            }),
            ExtractMode::QueueThenPush { after } => {
                let hub = self.hub.clone();
                let record_id = record_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    hub.publish(StatusUpdate {
                        status: completed(&record_id),
                        record_id,
                        usage: Some(USAGE),
                    });
                });
                Ok(ExtractionOutcome {
                    status: ExtractionStatus::Queued,
                    usage: None,
                })
            }
            ExtractMode::QueueOnly => Ok(ExtractionOutcome {
                status: ExtractionStatus::Queued,
                usage: None,
            }),
            ExtractMode::RateLimit => Err(Error::RateLimited { retry_after_ms: 0 }),
            ExtractMode::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// One set of fakes with handles kept for assertions
pub struct Fakes {
    pub validator: Arc<FakeValidator>,
    pub optimizer: Arc<FakeOptimizer>,
    pub uploader: Arc<FakeUploader>,
    pub record_store: Arc<FakeRecordStore>,
    pub extractor: Arc<FakeExtractor>,
    pub hub: Arc<StatusHub>,
}

impl Fakes {
    pub fn new() -> Self {
        let hub = Arc::new(StatusHub::default());
        Self {
            validator: Arc::new(FakeValidator { max_files: 50 }),
            optimizer: Arc::new(FakeOptimizer::default()),
            uploader: Arc::new(FakeUploader::default()),
            record_store: Arc::new(FakeRecordStore::default()),
            extractor: Arc::new(FakeExtractor::new(hub.clone())),
            hub,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            validator: self.validator.clone(),
            optimizer: self.optimizer.clone(),
            uploader: self.uploader.clone(),
            record_store: self.record_store.clone(),
            extractor: self.extractor.clone(),
            status_push: self.hub.clone(),
        }
    }
}

/// A small valid JPEG-looking file
pub fn receipt(name: &str) -> FileRef {
    FileRef::new(name, vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 1, 2, 3])
}
