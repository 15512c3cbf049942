//! Batch-level types exposed to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::job::{FailureKind, JobId, JobSnapshot, JobStatus, Stage};
use super::metrics::Alert;

/// Observable copy of the scheduler's batch state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    /// Jobs in queue order
    pub jobs: Vec<JobSnapshot>,
    pub active_ids: HashSet<JobId>,
    pub completed_ids: HashSet<JobId>,
    pub failed_ids: HashSet<JobId>,
    pub is_processing: bool,
    pub is_paused: bool,
    pub max_concurrent: usize,
}

impl BatchSnapshot {
    /// Ids of pending jobs, in queue order
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && !self.active_ids.contains(&j.id))
            .map(|j| j.id)
            .collect()
    }

    pub fn job(&self, id: JobId) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Check the partition and concurrency invariants, describing the first violation
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.active_ids.len() > self.max_concurrent {
            return Err(format!(
                "{} active jobs exceed max_concurrent {}",
                self.active_ids.len(),
                self.max_concurrent
            ));
        }
        let pending: HashSet<JobId> = self.pending_ids().into_iter().collect();
        for job in &self.jobs {
            let memberships = [
                pending.contains(&job.id),
                self.active_ids.contains(&job.id),
                self.completed_ids.contains(&job.id),
                self.failed_ids.contains(&job.id),
            ]
            .iter()
            .filter(|m| **m)
            .count();
            if memberships != 1 {
                return Err(format!("job {} appears in {} sets", job.id, memberships));
            }
        }
        let known: HashSet<JobId> = self.jobs.iter().map(|j| j.id).collect();
        for id in self
            .active_ids
            .iter()
            .chain(&self.completed_ids)
            .chain(&self.failed_ids)
        {
            if !known.contains(id) {
                return Err(format!("job {} tracked but not in the queue", id));
            }
        }
        Ok(())
    }
}

/// A file refused at admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedFile {
    pub filename: String,
    pub reason: String,
}

/// Result of an enqueue call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueReport {
    /// Ids of the admitted jobs, in submission order
    pub job_ids: Vec<JobId>,
    pub rejected: Vec<RejectedFile>,
}

/// Result of `start()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    Resumed,
    AlreadyRunning,
}

/// Result of `cancel()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and was removed from the queue
    Removed,
    /// The job is in flight and will stop at its next checkpoint
    Requested,
}

/// Final accounting for one scheduling run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_files: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed job counts keyed by failure kind name
    pub failures_by_kind: BTreeMap<String, usize>,
    pub api_calls_total: u64,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    pub error_rate: f64,
}

impl BatchSummary {
    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures_by_kind
            .get(&kind.to_string())
            .copied()
            .unwrap_or(0)
    }
}

/// Structured events published by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobsAdmitted { job_ids: Vec<JobId> },
    JobStarted { job_id: JobId, attempt: u32, priority: u8 },
    StageChanged { job_id: JobId, stage: Stage },
    JobCompleted { job_id: JobId, record_id: Option<String> },
    JobFailed { job_id: JobId, kind: FailureKind, stage: Stage, error: String },
    JobRetried { failed_job_id: JobId, new_job_id: JobId, attempt: u32 },
    JobCancelRequested { job_id: JobId },
    JobRemoved { job_id: JobId },
    /// Informational signal that needs no action (e.g. redundant start)
    Notice { message: String },
    Alert(Alert),
    Paused,
    BatchCompleted(BatchSummary),
}

