//! Error types for the ingestion system

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ingestion errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File rejected by validation
    #[error("Invalid file '{filename}': {reason}")]
    Validation { filename: String, reason: String },

    /// Hard quota breach reported at admission time
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network-level failure that is worth retrying
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Upload collaborator error
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Record store error
    #[error("Record store error: {0}")]
    Persist(String),

    /// Extraction collaborator error
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// External API refused the call (429 / quota)
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Job not known to the scheduler
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Operation not valid for the current job or batch state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Retry refused because the attempt budget is spent
    #[error("Max retries reached for job {job_id} ({attempts} attempts)")]
    MaxRetriesReached { job_id: Uuid, attempts: u32 },

    /// Scheduler task is gone
    #[error("Scheduler is not running")]
    SchedulerClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            filename: filename.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient network error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create an upload error
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload(message.into())
    }

    /// Create a record store error
    pub fn persist(message: impl Into<String>) -> Self {
        Self::Persist(message.into())
    }

    /// Create an extraction error
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a stage may retry the call that produced this error
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Io(_) => true,
            Error::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether this error signals the external API's rate limit
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::QuotaExceeded(_))
    }
}
