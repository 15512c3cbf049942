//! receipt-ingest: concurrency-bounded batch ingestion of receipt images
//!
//! Files are validated at admission, queued by risk priority and pushed
//! through a six-stage pipeline (validate, optimize, upload, persist, mark
//! uploaded, extract) by a scheduler that never runs more than
//! `max_concurrent` jobs at once. Extraction calls go through a client-side
//! rate limiter with exponential backoff, failed jobs can be retried with a
//! bounded attempt budget, and aggregate progress (throughput, ETA, error
//! rate, cost) is published on watch channels.
//!
//! ```no_run
//! use receipt_ingest::{BatchScheduler, IngestConfig, RateLimiter};
//! # async fn demo(collaborators: receipt_ingest::providers::Collaborators) -> receipt_ingest::Result<()> {
//! let config = IngestConfig::default();
//! let limiter = std::sync::Arc::new(RateLimiter::new(config.rate_limit.clone()));
//! let scheduler = BatchScheduler::spawn(&config, collaborators, limiter, None);
//! scheduler.start().await?;
//! let done = scheduler.wait_until_idle().await?;
//! println!("{} completed", done.completed_ids.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod processing;
pub mod providers;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod types;

pub use config::IngestConfig;
pub use error::{Error, Result};
pub use processing::{BatchScheduler, RetryPolicy};
pub use rate_limit::{RateLimitBudget, RateLimiter};
pub use session::SessionRecorder;
pub use storage::ReceiptDb;
pub use types::{
    BatchSnapshot, BatchSummary, CancelOutcome, EnqueueReport, FailureKind, FileRef, JobId,
    ProgressMetrics, RiskLevel, SchedulerEvent, StartOutcome,
};
