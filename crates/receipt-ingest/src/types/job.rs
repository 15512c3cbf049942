//! Job types: one file's journey through the pipeline

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

/// Identifier of a downstream receipt record
pub type RecordId = String;

/// A user-submitted file (receipt image or PDF)
#[derive(Debug, Clone)]
pub struct FileRef {
    /// Original filename as uploaded
    pub filename: String,
    /// File contents
    pub data: Bytes,
    /// MIME type, if the caller knows it
    pub content_type: Option<String>,
}

impl FileRef {
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            content_type: None,
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Lowercase extension, empty if there is none
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }

    /// SHA-256 of the contents, hex encoded
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

/// Risk classification supplied at admission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskLevel {
    /// Queue priority; the highest pending priority starts first
    pub fn priority(self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Optimize,
    Upload,
    Persist,
    MarkUploaded,
    Extract,
    Done,
}

impl Stage {
    /// All working stages in order
    pub const PIPELINE: [Stage; 6] = [
        Stage::Validate,
        Stage::Optimize,
        Stage::Upload,
        Stage::Persist,
        Stage::MarkUploaded,
        Stage::Extract,
    ];

    /// Share of the job's 100% this stage contributes
    pub fn weight(self) -> f32 {
        match self {
            Stage::Validate => 5.0,
            Stage::Optimize => 10.0,
            Stage::Upload => 35.0,
            Stage::Persist => 10.0,
            Stage::MarkUploaded => 5.0,
            Stage::Extract => 35.0,
            Stage::Done => 0.0,
        }
    }

    /// Percent banked by all stages before this one
    pub fn banked_before(self) -> f32 {
        Self::PIPELINE
            .iter()
            .take_while(|s| **s < self)
            .map(|s| s.weight())
            .sum()
    }

    /// Overall job percent given this stage's own fraction (0.0..=1.0)
    pub fn percent_at(self, fraction: f32) -> f32 {
        if self == Stage::Done {
            return 100.0;
        }
        self.banked_before() + self.weight() * fraction.clamp(0.0, 1.0)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Optimize => "optimize",
            Stage::Upload => "upload",
            Stage::Persist => "persist",
            Stage::MarkUploaded => "mark_uploaded",
            Stage::Extract => "extract",
            Stage::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or unsupported input
    ValidationError,
    /// Network hiccup inside a stage; only surfaces when the stage budget is spent
    TransientNetworkError,
    UploadError,
    PersistError,
    ProcessingError,
    RateLimited,
    /// User cancelled the job
    Cancelled,
    /// The file has used up all of its admissions
    MaxRetriesExceeded,
}

impl FailureKind {
    /// Whether `retry()` may re-admit a job that failed this way
    pub fn is_retry_eligible(self) -> bool {
        !matches!(
            self,
            FailureKind::ValidationError | FailureKind::Cancelled | FailureKind::MaxRetriesExceeded
        )
    }

    /// Whether the failure counts against the batch error rate
    pub fn counts_as_error(self) -> bool {
        self != FailureKind::Cancelled
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::TransientNetworkError => "transient_network_error",
            FailureKind::UploadError => "upload_error",
            FailureKind::PersistError => "persist_error",
            FailureKind::ProcessingError => "processing_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Cancelled => "cancelled",
            FailureKind::MaxRetriesExceeded => "max_retries_exceeded",
        };
        f.write_str(name)
    }
}

/// A job tracked by the scheduler
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub file: FileRef,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress_percent: f32,
    /// 1 for the first admission, incremented on each retry
    pub attempt: u32,
    pub priority: u8,
    pub risk: RiskLevel,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub record_id: Option<RecordId>,
    /// First job of the retry lineage (equals `id` for an original admission)
    pub original_job_id: JobId,
    /// Admission order, used to break priority ties
    pub seq: u64,
    /// Earliest instant this job may start (set on retries)
    pub not_before: Option<tokio::time::Instant>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a freshly admitted job
    pub fn new(file: FileRef, risk: RiskLevel, seq: u64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            file,
            status: JobStatus::Pending,
            stage: Stage::Validate,
            progress_percent: 0.0,
            attempt: 1,
            priority: risk.priority(),
            risk,
            error: None,
            failure_kind: None,
            record_id: None,
            original_job_id: id,
            seq,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Create the re-admission of a failed job
    pub fn retry_of(previous: &Job, seq: u64, delay: Duration) -> Self {
        let mut job = Self::new(previous.file.clone(), previous.risk, seq);
        job.attempt = previous.attempt + 1;
        job.priority = previous.priority;
        job.original_job_id = previous.original_job_id;
        job.not_before = Some(deadline_after(tokio::time::Instant::now(), delay));
        job
    }

    pub fn is_pending(&self) -> bool {
        self.status == JobStatus::Pending
    }

    /// Whether the job may start at `now`
    pub fn is_eligible(&self, now: tokio::time::Instant) -> bool {
        self.is_pending() && self.not_before.map(|t| t <= now).unwrap_or(true)
    }

    /// Ordering key: higher priority first, then admission order
    pub fn queue_key(&self) -> (std::cmp::Reverse<u8>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }

    pub fn snapshot(&self, display_percent: f32) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            filename: self.file.filename.clone(),
            size_bytes: self.file.size(),
            status: self.status,
            stage: self.stage,
            progress_percent: self.progress_percent,
            display_percent,
            attempt: self.attempt,
            priority: self.priority,
            risk: self.risk,
            error: self.error.clone(),
            failure_kind: self.failure_kind,
            record_id: self.record_id.clone(),
            original_job_id: self.original_job_id,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only view of a job for observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub filename: String,
    pub size_bytes: u64,
    pub status: JobStatus,
    pub stage: Stage,
    /// True progress reported by the pipeline
    pub progress_percent: f32,
    /// Smoothed progress for display
    pub display_percent: f32,
    pub attempt: u32,
    pub priority: u8,
    pub risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub original_job_id: JobId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-lineage retry bookkeeping
#[derive(Debug, Clone)]
pub struct RetryRecord {
    /// Attempt number of the job that failed
    pub attempt: u32,
    pub last_error_kind: FailureKind,
    /// When a re-admission becomes eligible to start
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// Instant `delay` after `now`, clamped to a far-future point instead of overflowing
pub fn deadline_after(now: tokio::time::Instant, delay: Duration) -> tokio::time::Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    now.checked_add(delay.min(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(86_400)))
        .unwrap_or(now)
}
