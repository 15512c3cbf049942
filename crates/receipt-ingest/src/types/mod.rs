//! Core data types for jobs, batches and metrics

pub mod batch;
pub mod job;
pub mod metrics;

pub use batch::{
    BatchSnapshot, BatchSummary, CancelOutcome, EnqueueReport, RejectedFile,
    SchedulerEvent, StartOutcome,
};
pub use job::{
    FailureKind, FileRef, Job, JobId, JobSnapshot, JobStatus, RecordId, RetryRecord, RiskLevel,
    Stage,
};
pub use metrics::{Alert, ProgressEvent, ProgressMetrics, TokenUsage};
