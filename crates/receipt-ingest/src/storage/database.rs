//! SQLite database for receipt records, session history and shared quota
//!
//! One file backs three collaborators: the record store the pipeline writes
//! to, the session store the recorder writes to, and the quota backend that
//! lets several ingest processes share one API budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::providers::{ExtractionStatus, RecordMeta, RecordStore, SessionStore};
use crate::rate_limit::{QuotaDecision, RateLimiterBackend};
use crate::types::{BatchSummary, JobId, RecordId, RiskLevel};

/// A stored receipt record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub id: RecordId,
    pub job_id: JobId,
    pub original_job_id: JobId,
    pub filename: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub url: String,
    pub content_type: Option<String>,
    pub risk: RiskLevel,
    pub uploaded: bool,
    pub extraction: Option<ExtractionStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record counts for reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptDbStats {
    pub total_records: usize,
    pub uploaded: usize,
    pub extracted: usize,
    pub sessions: usize,
}

/// SQLite-backed store
#[derive(Clone)]
pub struct ReceiptDb {
    conn: Arc<Mutex<Connection>>,
}

impl ReceiptDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
        "#).map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS receipts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL UNIQUE,
                original_job_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                url TEXT NOT NULL,
                content_type TEXT,
                risk TEXT NOT NULL,
                uploaded INTEGER NOT NULL DEFAULT 0,
                extraction TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_content_hash ON receipts(content_hash);
            CREATE INDEX IF NOT EXISTS idx_receipts_original_job ON receipts(original_job_id);

            CREATE TABLE IF NOT EXISTS sessions (
                batch_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                total_files INTEGER NOT NULL,
                succeeded INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                failures_by_kind TEXT NOT NULL,
                api_calls_total INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL,
                estimated_cost REAL NOT NULL,
                error_rate REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_completed ON sessions(completed_at);

            -- Shared API budget, one row per window
            CREATE TABLE IF NOT EXISTS quota_windows (
                window_ms INTEGER NOT NULL,
                window_start INTEGER NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (window_ms, window_start)
            );
        "#)
        .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    // ==================== Receipt Records ====================

    /// Insert a record for a job, or return the existing one's id
    pub fn create_record(&self, meta: &RecordMeta) -> Result<RecordId> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO receipts (
                id, job_id, original_job_id, filename, content_hash, size_bytes,
                url, content_type, risk, uploaded, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)
            ON CONFLICT(job_id) DO NOTHING
            "#,
            params![
                Uuid::new_v4().to_string(),
                meta.job_id.to_string(),
                meta.original_job_id.to_string(),
                meta.filename,
                meta.content_hash,
                meta.size_bytes as i64,
                meta.url,
                meta.content_type,
                risk_to_str(meta.risk),
                now,
            ],
        ).map_err(|e| Error::persist(format!("Failed to insert receipt: {}", e)))?;

        let id: String = conn
            .query_row(
                "SELECT id FROM receipts WHERE job_id = ?1",
                params![meta.job_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| Error::persist(format!("Failed to read receipt id: {}", e)))?;
        Ok(id)
    }

    pub fn set_uploaded(&self, record_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE receipts SET uploaded = 1, updated_at = ?2 WHERE id = ?1",
                params![record_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::persist(format!("Failed to mark receipt uploaded: {}", e)))?;
        if updated == 0 {
            return Err(Error::persist(format!("unknown receipt {}", record_id)));
        }
        Ok(())
    }

    /// Store the extraction state of a record
    pub fn save_extraction(&self, record_id: &str, status: &ExtractionStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE receipts SET extraction = ?2, updated_at = ?3 WHERE id = ?1",
            params![record_id, serde_json::to_string(status)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_record(&self, record_id: &str) -> Result<Option<ReceiptRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM receipts WHERE id = ?1")?;
        let record = stmt
            .query_row(params![record_id], row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Records for every attempt of one file, oldest first
    pub fn records_for_lineage(&self, original_job_id: JobId) -> Result<Vec<ReceiptRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM receipts WHERE original_job_id = ?1 ORDER BY created_at",
        )?;
        let records = stmt
            .query_map(params![original_job_id.to_string()], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get_stats(&self) -> Result<ReceiptDbStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(ReceiptDbStats {
            total_records: count("SELECT COUNT(*) FROM receipts")?,
            uploaded: count("SELECT COUNT(*) FROM receipts WHERE uploaded = 1")?,
            extracted: count(
                "SELECT COUNT(*) FROM receipts WHERE json_extract(extraction, '$.status') = 'completed'",
            )?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
        })
    }

    // ==================== Sessions ====================

    pub fn upsert_session(&self, summary: &BatchSummary) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO sessions (
                batch_id, started_at, completed_at, duration_ms, total_files, succeeded,
                failed, failures_by_kind, api_calls_total, tokens_used, estimated_cost, error_rate
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(batch_id) DO UPDATE SET
                completed_at = excluded.completed_at,
                duration_ms = excluded.duration_ms,
                total_files = excluded.total_files,
                succeeded = excluded.succeeded,
                failed = excluded.failed,
                failures_by_kind = excluded.failures_by_kind,
                api_calls_total = excluded.api_calls_total,
                tokens_used = excluded.tokens_used,
                estimated_cost = excluded.estimated_cost,
                error_rate = excluded.error_rate
            "#,
            params![
                summary.batch_id.to_string(),
                summary.started_at.to_rfc3339(),
                summary.completed_at.to_rfc3339(),
                summary.duration_ms as i64,
                summary.total_files as i64,
                summary.succeeded as i64,
                summary.failed as i64,
                serde_json::to_string(&summary.failures_by_kind)?,
                summary.api_calls_total as i64,
                summary.tokens_used as i64,
                summary.estimated_cost,
                summary.error_rate,
            ],
        ).map_err(|e| Error::Internal(format!("Failed to save session: {}", e)))?;
        Ok(())
    }

    /// Most recent sessions first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions ORDER BY completed_at DESC LIMIT ?1",
        )?;
        let sessions = stmt
            .query_map(params![limit as i64], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // ==================== Shared Quota ====================

    /// Consume from the current window if the request fits, atomically across processes
    pub fn consume_quota(
        &self,
        requests: u32,
        tokens: u32,
        limits: (u32, u32),
        window: Duration,
    ) -> Result<QuotaDecision> {
        let window_ms = (window.as_millis() as i64).max(1);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - now_ms.rem_euclid(window_ms);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (used_requests, used_tokens): (i64, i64) = tx
            .query_row(
                "SELECT requests, tokens FROM quota_windows WHERE window_ms = ?1 AND window_start = ?2",
                params![window_ms, window_start],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((0, 0));

        let fits = used_requests + requests as i64 <= limits.0 as i64
            && used_tokens + tokens as i64 <= limits.1 as i64;
        if !fits {
            tx.commit()?;
            let retry_after = (window_start + window_ms - now_ms).max(0) as u64;
            return Ok(QuotaDecision::denied(Duration::from_millis(retry_after)));
        }

        tx.execute(
            r#"
            INSERT INTO quota_windows (window_ms, window_start, requests, tokens)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(window_ms, window_start) DO UPDATE SET
                requests = requests + excluded.requests,
                tokens = tokens + excluded.tokens
            "#,
            params![window_ms, window_start, requests as i64, tokens as i64],
        )?;
        // Old windows are never read again
        tx.execute(
            "DELETE FROM quota_windows WHERE window_ms = ?1 AND window_start < ?2",
            params![window_ms, window_start],
        )?;
        tx.commit()?;
        Ok(QuotaDecision::granted())
    }

    /// Subtract unused usage from the current shared window
    ///
    /// Usage from a window that has already rolled over is gone; nothing is
    /// refunded into the new one.
    pub fn return_quota(&self, requests: u32, tokens: u32, window: Duration) -> Result<()> {
        let window_ms = (window.as_millis() as i64).max(1);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - now_ms.rem_euclid(window_ms);

        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE quota_windows
            SET requests = MAX(requests - ?3, 0), tokens = MAX(tokens - ?4, 0)
            WHERE window_ms = ?1 AND window_start = ?2
            "#,
            params![window_ms, window_start, requests as i64, tokens as i64],
        )?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for ReceiptDb {
    async fn create(&self, meta: &RecordMeta) -> Result<RecordId> {
        self.create_record(meta)
    }

    async fn mark_uploaded(&self, record_id: &RecordId) -> Result<()> {
        self.set_uploaded(record_id)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl SessionStore for ReceiptDb {
    async fn save_session(&self, summary: &BatchSummary) -> Result<()> {
        self.upsert_session(summary)
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        self.recent_sessions(limit)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl RateLimiterBackend for ReceiptDb {
    async fn try_consume(
        &self,
        requests: u32,
        tokens: u32,
        limits: (u32, u32),
        window: Duration,
    ) -> Result<QuotaDecision> {
        self.consume_quota(requests, tokens, limits, window)
    }

    async fn refund(&self, requests: u32, tokens: u32, window: Duration) -> Result<()> {
        self.return_quota(requests, tokens, window)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// ==================== Row Helpers ====================

fn risk_to_str(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
    }
}

fn parse_time(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_uuid(value: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row) -> rusqlite::Result<ReceiptRecord> {
    let extraction: Option<String> = row.get("extraction")?;
    let risk: String = row.get("risk")?;

    Ok(ReceiptRecord {
        id: row.get("id")?,
        job_id: parse_uuid(row.get("job_id")?)?,
        original_job_id: parse_uuid(row.get("original_job_id")?)?,
        filename: row.get("filename")?,
        content_hash: row.get("content_hash")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        url: row.get("url")?,
        content_type: row.get("content_type")?,
        risk: risk.parse().unwrap_or_default(),
        uploaded: row.get::<_, i64>("uploaded")? != 0,
        extraction: extraction.and_then(|json| serde_json::from_str(&json).ok()),
        created_at: parse_time(row.get("created_at")?)?,
        updated_at: parse_time(row.get("updated_at")?)?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<BatchSummary> {
    let failures: String = row.get("failures_by_kind")?;
    let failures_by_kind: BTreeMap<String, usize> =
        serde_json::from_str(&failures).unwrap_or_default();

    Ok(BatchSummary {
        batch_id: parse_uuid(row.get("batch_id")?)?,
        started_at: parse_time(row.get("started_at")?)?,
        completed_at: parse_time(row.get("completed_at")?)?,
        duration_ms: row.get::<_, i64>("duration_ms")? as u64,
        total_files: row.get::<_, i64>("total_files")? as usize,
        succeeded: row.get::<_, i64>("succeeded")? as usize,
        failed: row.get::<_, i64>("failed")? as usize,
        failures_by_kind,
        api_calls_total: row.get::<_, i64>("api_calls_total")? as u64,
        tokens_used: row.get::<_, i64>("tokens_used")? as u64,
        estimated_cost: row.get("estimated_cost")?,
        error_rate: row.get("error_rate")?,
    })
}
