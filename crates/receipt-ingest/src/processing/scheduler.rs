//! Batch scheduler
//!
//! `BatchScheduler` is a cheap handle to an actor task that owns the batch.
//! Callers send commands over an mpsc channel and get answers on oneshot
//! channels; the actor is the only writer of job state. Pipelines run in a
//! `JoinSet` and report through `PipelineEvent`s, so a job that errors or
//! panics becomes a `Failed` transition without touching the others.
//!
//! Observers read three channels:
//! - `watch<BatchSnapshot>`: the queue after every transition
//! - `watch<ProgressMetrics>`: aggregate numbers, recomputed on every event
//! - `broadcast<SchedulerEvent>`: discrete happenings (starts, failures, alerts)

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use super::pipeline::{JobContext, JobPipeline, PipelineEvent, PipelineFailure, PipelineResult};
use super::progress::ProgressAggregator;
use super::race::{cancel_pair, CancelHandle};
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::{IngestConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::providers::{Collaborators, Validation, Validator};
use crate::rate_limit::{RateLimitBudget, RateLimiter};
use crate::session::SessionRecorder;
use crate::types::{
    BatchSnapshot, BatchSummary, CancelOutcome, EnqueueReport, FailureKind, FileRef, Job, JobId,
    JobStatus, ProgressMetrics, RejectedFile, RetryRecord, RiskLevel, SchedulerEvent, Stage,
    StartOutcome,
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 1024;

enum Command {
    Admit {
        files: Vec<(FileRef, RiskLevel)>,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Start {
        reply: oneshot::Sender<StartOutcome>,
    },
    Pause {
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<CancelOutcome>>,
    },
    Retry {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobId>>,
    },
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// Handle to a running scheduler
#[derive(Clone)]
pub struct BatchScheduler {
    commands: mpsc::Sender<Command>,
    validator: Arc<dyn Validator>,
    limiter: Arc<RateLimiter>,
    state_rx: watch::Receiver<BatchSnapshot>,
    metrics_rx: watch::Receiver<ProgressMetrics>,
    summary_rx: watch::Receiver<Option<BatchSummary>>,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl BatchScheduler {
    /// Spawn the scheduler actor on the current runtime
    pub fn spawn(
        config: &IngestConfig,
        collaborators: Collaborators,
        limiter: Arc<RateLimiter>,
        recorder: Option<SessionRecorder>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let batch_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(BatchSnapshot {
            batch_id,
            max_concurrent: config.scheduler.max_concurrent,
            ..Default::default()
        });
        let (metrics_tx, metrics_rx) = watch::channel(ProgressMetrics::default());
        let (summary_tx, summary_rx) = watch::channel(None);

        let validator = collaborators.validator.clone();
        let actor = SchedulerActor {
            config: config.scheduler.clone(),
            policy: RetryPolicy::new(config.scheduler.max_retries, &config.retry),
            pipeline: JobPipeline::new(collaborators, limiter.clone(), config.pipeline.clone()),
            batch_id,
            jobs: Vec::new(),
            active: HashMap::new(),
            task_jobs: HashMap::new(),
            completed_ids: HashSet::new(),
            failed_ids: HashSet::new(),
            retry_records: HashMap::new(),
            run_jobs: HashSet::new(),
            is_processing: false,
            is_paused: false,
            next_seq: 0,
            run_started: None,
            aggregator: ProgressAggregator::new(config.progress.clone()),
            tasks: JoinSet::new(),
            pipeline_tx,
            pipeline_rx,
            commands: commands_rx,
            commands_open: true,
            state_tx,
            metrics_tx,
            summary_tx,
            events_tx: events_tx.clone(),
            recorder,
        };

        tracing::info!(
            "Scheduler started: max {} concurrent jobs, {} attempts per file",
            config.scheduler.max_concurrent,
            config.scheduler.max_retries
        );
        tokio::spawn(actor.run().instrument(tracing::info_span!("scheduler")));

        Self {
            commands: commands_tx,
            validator,
            limiter,
            state_rx,
            metrics_rx,
            summary_rx,
            events_tx,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)
    }

    /// Validate and admit files
    ///
    /// A quota breach rejects the whole call. Otherwise every valid file
    /// becomes a pending job and invalid files are listed in `rejected`.
    /// `risk_hints[i]` applies to `files[i]`; missing hints mean medium risk.
    pub async fn enqueue(&self, files: Vec<FileRef>, risk_hints: &[RiskLevel]) -> Result<EnqueueReport> {
        self.validator.check_quota(&files).await?;

        let mut admitted = Vec::new();
        let mut rejected = Vec::new();
        for (i, file) in files.into_iter().enumerate() {
            match self.validator.check(&file).await {
                Validation::Valid => {
                    let risk = risk_hints.get(i).copied().unwrap_or_default();
                    admitted.push((file, risk));
                }
                Validation::Invalid(reason) => {
                    tracing::warn!("Rejected {}: {}", file.filename, reason);
                    rejected.push(RejectedFile {
                        filename: file.filename,
                        reason,
                    });
                }
            }
        }

        let job_ids = if admitted.is_empty() {
            Vec::new()
        } else {
            self.request(|reply| Command::Admit {
                files: admitted,
                reply,
            })
            .await?
        };
        Ok(EnqueueReport { job_ids, rejected })
    }

    /// Begin (or resume) processing; a second call while running is a no-op
    pub async fn start(&self) -> Result<StartOutcome> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop starting new jobs; returns false if nothing was running
    pub async fn pause(&self) -> Result<bool> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        self.request(|reply| Command::Cancel { job_id, reply }).await?
    }

    /// Re-admit a failed job; returns the new job id
    pub async fn retry(&self, job_id: JobId) -> Result<JobId> {
        self.request(|reply| Command::Retry { job_id, reply }).await?
    }

    /// Drop completed jobs from the queue; returns how many were removed
    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| Command::ClearCompleted { reply }).await
    }

    /// Drop every job; refused while processing unless paused
    pub async fn clear_all(&self) -> Result<usize> {
        self.request(|reply| Command::ClearAll { reply }).await?
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn metrics(&self) -> ProgressMetrics {
        self.metrics_rx.borrow().clone()
    }

    /// Summary of the most recently completed run
    pub fn last_summary(&self) -> Option<BatchSummary> {
        self.summary_rx.borrow().clone()
    }

    pub fn rate_limit_budget(&self) -> RateLimitBudget {
        self.limiter.budget()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BatchSnapshot> {
        self.state_rx.clone()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<ProgressMetrics> {
        self.metrics_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until the current run has finished
    pub async fn wait_until_idle(&self) -> Result<BatchSnapshot> {
        let mut rx = self.state_rx.clone();
        let snapshot = rx
            .wait_for(|s| !s.is_processing)
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        Ok(snapshot.clone())
    }
}

struct ActiveJob {
    cancel: CancelHandle,
}

struct SchedulerActor {
    config: SchedulerConfig,
    policy: RetryPolicy,
    pipeline: JobPipeline,
    batch_id: Uuid,
    /// Kept sorted by `Job::queue_key`
    jobs: Vec<Job>,
    active: HashMap<JobId, ActiveJob>,
    task_jobs: HashMap<tokio::task::Id, JobId>,
    completed_ids: HashSet<JobId>,
    failed_ids: HashSet<JobId>,
    retry_records: HashMap<JobId, RetryRecord>,
    /// Jobs launched during the current run
    run_jobs: HashSet<JobId>,
    is_processing: bool,
    is_paused: bool,
    next_seq: u64,
    run_started: Option<(DateTime<Utc>, Instant)>,
    aggregator: ProgressAggregator,
    tasks: JoinSet<PipelineResult>,
    pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
    pipeline_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    state_tx: watch::Sender<BatchSnapshot>,
    metrics_tx: watch::Sender<ProgressMetrics>,
    summary_tx: watch::Sender<Option<BatchSummary>>,
    events_tx: broadcast::Sender<SchedulerEvent>,
    recorder: Option<SessionRecorder>,
}

impl SchedulerActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;

                Some(event) = self.pipeline_rx.recv() => {
                    self.apply_event(event);
                    self.publish();
                }

                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined);
                }

                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle(command),
                    None => self.commands_open = false,
                },

                _ = ticker.tick(), if self.aggregator.is_animating() => {
                    if self.aggregator.tick() {
                        self.publish_state();
                    }
                }

                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.pump();
                    self.publish();
                }
            }

            if !self.commands_open && self.tasks.is_empty() {
                tracing::info!("All scheduler handles dropped, shutting down");
                break;
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    /// Apply a command; state is published before the caller hears back
    fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { files, reply } => {
                let ids = self.admit(files);
                self.publish();
                let _ = reply.send(ids);
            }
            Command::Start { reply } => {
                let outcome = self.start();
                self.publish();
                let _ = reply.send(outcome);
            }
            Command::Pause { reply } => {
                let paused = self.pause();
                self.publish();
                let _ = reply.send(paused);
            }
            Command::Cancel { job_id, reply } => {
                let result = self.cancel(job_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Retry { job_id, reply } => {
                let result = self.retry(job_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::ClearCompleted { reply } => {
                let removed = self.remove_where(|job| job.status == JobStatus::Completed);
                self.publish();
                let _ = reply.send(removed);
            }
            Command::ClearAll { reply } => {
                let result = self.clear_all();
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn sort_queue(&mut self) {
        self.jobs.sort_by_key(|job| job.queue_key());
    }

    fn job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == job_id)
    }

    fn admit(&mut self, files: Vec<(FileRef, RiskLevel)>) -> Vec<JobId> {
        let mut ids = Vec::with_capacity(files.len());
        for (file, risk) in files {
            let job = Job::new(file, risk, self.next_seq);
            self.next_seq += 1;
            tracing::debug!(job_id = %job.id, "Admitted {} ({:?} risk)", job.file.filename, risk);
            self.aggregator.track(job.id);
            ids.push(job.id);
            self.jobs.push(job);
        }
        self.sort_queue();
        tracing::info!("Admitted {} jobs, {} in queue", ids.len(), self.jobs.len());
        self.emit(SchedulerEvent::JobsAdmitted {
            job_ids: ids.clone(),
        });
        self.pump();
        ids
    }

    fn start(&mut self) -> StartOutcome {
        if self.is_processing && !self.is_paused {
            self.emit(SchedulerEvent::Notice {
                message: "batch is already running".into(),
            });
            return StartOutcome::AlreadyRunning;
        }

        if self.is_processing {
            self.is_paused = false;
            tracing::info!(batch_id = %self.batch_id, "Batch resumed");
            self.pump();
            self.check_completion();
            return StartOutcome::Resumed;
        }

        self.is_processing = true;
        self.is_paused = false;
        self.batch_id = Uuid::new_v4();
        self.run_jobs.clear();
        let now = Instant::now();
        self.run_started = Some((Utc::now(), now));
        self.aggregator.reset_run(now);
        tracing::info!(
            batch_id = %self.batch_id,
            "Batch started with {} pending jobs",
            self.pending_count()
        );
        self.pump();
        self.check_completion();
        StartOutcome::Started
    }

    fn pause(&mut self) -> bool {
        if !self.is_processing || self.is_paused {
            return false;
        }
        self.is_paused = true;
        tracing::info!(
            batch_id = %self.batch_id,
            "Batch paused, {} jobs still in flight",
            self.active.len()
        );
        self.emit(SchedulerEvent::Paused);
        true
    }

    fn cancel(&mut self, job_id: JobId) -> Result<CancelOutcome> {
        let status = self
            .jobs
            .iter()
            .find(|job| job.id == job_id)
            .map(|job| job.status)
            .ok_or(Error::JobNotFound(job_id))?;

        match status {
            JobStatus::Pending => {
                self.remove_where(|job| job.id == job_id);
                tracing::info!(job_id = %job_id, "Pending job cancelled and removed");
                self.check_completion();
                Ok(CancelOutcome::Removed)
            }
            JobStatus::Active => {
                if let Some(active) = self.active.get(&job_id) {
                    active.cancel.cancel();
                }
                tracing::info!(job_id = %job_id, "Cancellation requested");
                self.emit(SchedulerEvent::JobCancelRequested { job_id });
                Ok(CancelOutcome::Requested)
            }
            JobStatus::Completed | JobStatus::Failed => Err(Error::InvalidState(format!(
                "job {} has already finished",
                job_id
            ))),
        }
    }

    fn retry(&mut self, job_id: JobId) -> Result<JobId> {
        let previous = self
            .jobs
            .iter()
            .find(|job| job.id == job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))?;

        if previous.status != JobStatus::Failed {
            return Err(Error::InvalidState(format!("job {} has not failed", job_id)));
        }
        let kind = previous.failure_kind.unwrap_or(FailureKind::ProcessingError);
        let delay = match self.policy.decide(previous.attempt, kind) {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::GiveUp {
                kind: FailureKind::MaxRetriesExceeded,
            } => {
                return Err(Error::MaxRetriesReached {
                    job_id,
                    attempts: previous.attempt,
                })
            }
            RetryDecision::GiveUp { kind } => {
                return Err(Error::InvalidState(format!(
                    "{} failures cannot be retried",
                    kind
                )))
            }
        };
        let job = Job::retry_of(&previous, self.next_seq, delay);
        self.next_seq += 1;
        let new_id = job.id;

        // The failed attempt is replaced by its successor
        self.jobs.retain(|j| j.id != job_id);
        self.failed_ids.remove(&job_id);
        self.aggregator.forget(job_id);
        let mut record = self.retry_records.remove(&job_id).unwrap_or(RetryRecord {
            attempt: previous.attempt,
            last_error_kind: kind,
            next_eligible_at: None,
        });
        record.attempt = job.attempt;
        record.next_eligible_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        self.retry_records.insert(new_id, record);

        tracing::info!(
            job_id = %new_id,
            original_job_id = %job.original_job_id,
            attempt = job.attempt,
            "Retrying {} in {:?}",
            job.file.filename,
            delay
        );
        self.emit(SchedulerEvent::JobRetried {
            failed_job_id: job_id,
            new_job_id: new_id,
            attempt: job.attempt,
        });

        self.aggregator.track(new_id);
        self.jobs.push(job);
        self.sort_queue();
        self.pump();
        Ok(new_id)
    }

    fn clear_all(&mut self) -> Result<usize> {
        if self.is_processing && !self.is_paused {
            return Err(Error::InvalidState(
                "cannot clear the queue while the batch is running; pause it first".into(),
            ));
        }
        for (job_id, active) in &self.active {
            active.cancel.cancel();
            tracing::debug!(job_id = %job_id, "Cancelling in-flight job for clear");
        }
        let removed = self.remove_where(|job| job.status != JobStatus::Active);
        self.check_completion();
        Ok(removed)
    }

    /// Remove non-active jobs matching `predicate`
    fn remove_where(&mut self, predicate: impl Fn(&Job) -> bool) -> usize {
        let removed: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| job.status != JobStatus::Active && predicate(job))
            .map(|job| job.id)
            .collect();
        if removed.is_empty() {
            return 0;
        }

        let gone: HashSet<JobId> = removed.iter().copied().collect();
        self.jobs.retain(|job| !gone.contains(&job.id));
        for job_id in &removed {
            self.completed_ids.remove(job_id);
            self.failed_ids.remove(job_id);
            self.retry_records.remove(job_id);
            self.aggregator.forget(*job_id);
            self.emit(SchedulerEvent::JobRemoved { job_id: *job_id });
        }
        removed.len()
    }

    fn pending_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.is_pending()).count()
    }

    /// Earliest instant a delayed retry becomes startable, if one is waiting
    fn next_wake(&self) -> Option<Instant> {
        if !self.is_processing || self.is_paused || self.active.len() >= self.config.max_concurrent {
            return None;
        }
        let now = Instant::now();
        self.jobs
            .iter()
            .filter(|job| job.is_pending())
            .filter_map(|job| job.not_before)
            .filter(|at| *at > now)
            .min()
    }

    /// Start eligible jobs while there are free slots
    fn pump(&mut self) {
        if !self.is_processing || self.is_paused {
            return;
        }
        let now = Instant::now();
        while self.active.len() < self.config.max_concurrent {
            let Some(index) = self.jobs.iter().position(|job| job.is_eligible(now)) else {
                break;
            };
            self.launch(index);
        }
    }

    fn launch(&mut self, index: usize) {
        let (handle, signal) = cancel_pair();
        let job = &mut self.jobs[index];
        job.status = JobStatus::Active;
        job.stage = Stage::Validate;
        job.started_at = Some(Utc::now());

        let ctx = JobContext {
            job_id: job.id,
            original_job_id: job.original_job_id,
            attempt: job.attempt,
            file: job.file.clone(),
            risk: job.risk,
            cancel: signal,
        };
        let (job_id, attempt, priority) = (job.id, job.attempt, job.priority);
        tracing::info!(
            job_id = %job_id,
            attempt,
            priority,
            "Starting {}",
            job.file.filename
        );

        let pipeline = self.pipeline.clone();
        let events = self.pipeline_tx.clone();
        let span = tracing::info_span!("job", job_id = %job_id, attempt);
        let task = self
            .tasks
            .spawn(async move { pipeline.run(ctx, events).await }.instrument(span));

        self.task_jobs.insert(task.id(), job_id);
        self.run_jobs.insert(job_id);
        self.active.insert(job_id, ActiveJob { cancel: handle });
        self.aggregator.job_started(job_id, Instant::now());
        self.emit(SchedulerEvent::JobStarted {
            job_id,
            attempt,
            priority,
        });
    }

    fn apply_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageChanged { job_id, stage } => {
                if !self.active.contains_key(&job_id) {
                    return;
                }
                if let Some(job) = self.job_mut(job_id) {
                    job.stage = stage;
                }
                tracing::debug!(job_id = %job_id, stage = %stage, "Stage changed");
                self.emit(SchedulerEvent::StageChanged { job_id, stage });
            }
            PipelineEvent::Progress(progress) => {
                if !self.active.contains_key(&progress.job_id) {
                    return;
                }
                if let Some(job) = self.job_mut(progress.job_id) {
                    job.progress_percent = job.progress_percent.max(progress.percent);
                }
                self.aggregator.record(&progress);
            }
            PipelineEvent::RecordCreated { job_id, record_id } => {
                if let Some(job) = self.job_mut(job_id) {
                    job.record_id = Some(record_id);
                }
            }
            PipelineEvent::ApiCall { usage, .. } => self.aggregator.record_api_call(usage),
            PipelineEvent::RateLimited { job_id } => {
                tracing::warn!(job_id = %job_id, "Extraction rate limited");
                self.aggregator.record_rate_limit(Instant::now());
            }
        }
    }

    fn drain_pipeline_events(&mut self) {
        while let Ok(event) = self.pipeline_rx.try_recv() {
            self.apply_event(event);
        }
    }

    fn on_joined(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, PipelineResult), tokio::task::JoinError>,
    ) {
        // A finished task has sent all of its events; apply them first
        self.drain_pipeline_events();

        let (task_id, result) = match joined {
            Ok((task_id, result)) => (task_id, result),
            Err(join_error) => {
                let task_id = join_error.id();
                let stage = self
                    .task_jobs
                    .get(&task_id)
                    .and_then(|job_id| self.jobs.iter().find(|job| job.id == *job_id))
                    .map(|job| job.stage)
                    .unwrap_or(Stage::Validate);
                let message = if join_error.is_panic() {
                    "pipeline panicked".to_string()
                } else {
                    format!("pipeline aborted: {}", join_error)
                };
                (
                    task_id,
                    Err(PipelineFailure::new(FailureKind::ProcessingError, stage, message)),
                )
            }
        };

        match self.task_jobs.remove(&task_id) {
            Some(job_id) => self.finish(job_id, result),
            None => tracing::error!("Finished task {:?} has no job", task_id),
        }

        self.pump();
        self.check_completion();
        self.publish();
    }

    fn finish(&mut self, job_id: JobId, result: PipelineResult) {
        let Some(active) = self.active.remove(&job_id) else {
            return;
        };
        // A result that raced a cancel request is discarded
        let result = if active.cancel.is_cancelled() {
            match result {
                Err(failure) if failure.kind == FailureKind::Cancelled => Err(failure),
                Err(failure) => Err(PipelineFailure::new(
                    FailureKind::Cancelled,
                    failure.stage,
                    "cancelled by user",
                )),
                Ok(_) => Err(PipelineFailure::new(
                    FailureKind::Cancelled,
                    Stage::Extract,
                    "cancelled by user",
                )),
            }
        } else {
            result
        };

        let policy = self.policy.clone();
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == job_id) else {
            return;
        };
        job.finished_at = Some(Utc::now());

        match result {
            Ok(success) => {
                job.status = JobStatus::Completed;
                job.stage = Stage::Done;
                job.progress_percent = 100.0;
                job.record_id = Some(success.record_id.clone());
                self.completed_ids.insert(job_id);
                self.retry_records.remove(&job_id);
                self.aggregator.job_completed(job_id, Instant::now());
                self.emit(SchedulerEvent::JobCompleted {
                    job_id,
                    record_id: Some(success.record_id),
                });
            }
            Err(failure) => {
                let decision = policy.decide(job.attempt, failure.kind);
                let kind = match decision {
                    RetryDecision::Retry { .. } => failure.kind,
                    RetryDecision::GiveUp { kind } => kind,
                };
                job.status = JobStatus::Failed;
                job.stage = failure.stage;
                job.failure_kind = Some(kind);
                job.error = Some(failure.message.clone());
                let attempt = job.attempt;
                self.failed_ids.insert(job_id);

                if let RetryDecision::Retry { delay } = decision {
                    self.retry_records.insert(
                        job_id,
                        RetryRecord {
                            attempt,
                            last_error_kind: kind,
                            next_eligible_at: Some(
                                Utc::now()
                                    + chrono::Duration::from_std(delay)
                                        .unwrap_or_else(|_| chrono::Duration::zero()),
                            ),
                        },
                    );
                } else {
                    self.retry_records.remove(&job_id);
                }
                if kind == FailureKind::MaxRetriesExceeded {
                    tracing::warn!(job_id = %job_id, attempt, "Giving up after {} attempts", attempt);
                }

                self.aggregator.job_failed(job_id, kind);
                self.emit(SchedulerEvent::JobFailed {
                    job_id,
                    kind,
                    stage: failure.stage,
                    error: failure.message,
                });
            }
        }
    }

    /// Complete the run once nothing is pending or active
    fn check_completion(&mut self) {
        if !self.is_processing || !self.active.is_empty() || self.pending_count() > 0 {
            return;
        }
        self.is_processing = false;
        self.is_paused = false;

        let summary = self.summarize();
        tracing::info!(
            batch_id = %summary.batch_id,
            "Batch complete: {} succeeded, {} failed in {}ms",
            summary.succeeded,
            summary.failed,
            summary.duration_ms
        );
        self.summary_tx.send_replace(Some(summary.clone()));
        if let Some(recorder) = &self.recorder {
            recorder.record(summary.clone());
        }
        self.emit(SchedulerEvent::BatchCompleted(summary));
    }

    fn summarize(&mut self) -> BatchSummary {
        let now = Utc::now();
        let (started_at, started) = self.run_started.unwrap_or((now, Instant::now()));
        let metrics = self.aggregator.metrics(Instant::now());

        // Jobs retried within the run were replaced and are no longer in the queue
        let run_jobs: Vec<&Job> = self
            .jobs
            .iter()
            .filter(|job| self.run_jobs.contains(&job.id))
            .collect();
        let mut failures_by_kind = BTreeMap::new();
        for job in run_jobs.iter().filter(|job| job.status == JobStatus::Failed) {
            let kind = job.failure_kind.unwrap_or(FailureKind::ProcessingError);
            *failures_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
        let succeeded = run_jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .count();
        let failed = run_jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .count();

        BatchSummary {
            batch_id: self.batch_id,
            started_at,
            completed_at: now,
            duration_ms: started.elapsed().as_millis() as u64,
            total_files: run_jobs.len(),
            succeeded,
            failed,
            failures_by_kind,
            api_calls_total: metrics.api_calls_total,
            tokens_used: metrics.tokens_used,
            estimated_cost: metrics.estimated_cost,
            error_rate: metrics.error_rate,
        }
    }

    fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.batch_id,
            jobs: self
                .jobs
                .iter()
                .map(|job| job.snapshot(self.aggregator.display_percent(job.id)))
                .collect(),
            active_ids: self.active.keys().copied().collect(),
            completed_ids: self.completed_ids.clone(),
            failed_ids: self.failed_ids.clone(),
            is_processing: self.is_processing,
            is_paused: self.is_paused,
            max_concurrent: self.config.max_concurrent,
        }
    }

    fn publish_state(&self) {
        let snapshot = self.snapshot();
        debug_assert!(
            snapshot.check_invariants().is_ok(),
            "batch invariant violated: {:?}",
            snapshot.check_invariants()
        );
        self.state_tx.send_replace(snapshot);
    }

    fn publish(&mut self) {
        self.publish_state();
        self.metrics_tx
            .send_replace(self.aggregator.metrics(Instant::now()));
        for alert in self.aggregator.take_alerts() {
            tracing::warn!("Batch alert: {}", alert);
            self.emit(SchedulerEvent::Alert(alert));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::processing::testing::{receipt, ExtractMode, Fakes};
    use std::time::Duration;

    fn test_config(max_concurrent: usize) -> IngestConfig {
        let mut config = IngestConfig::default();
        config.scheduler.max_concurrent = max_concurrent;
        config.scheduler.tick_interval_ms = 5;
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 40;
        config.pipeline.stage_backoff_ms = 1;
        config.pipeline.extract_timeout_ms = 2_000;
        config.pipeline.estimated_tokens_per_job = 100;
        config
    }

    fn spawn(fakes: &Fakes, config: &IngestConfig) -> BatchScheduler {
        BatchScheduler::spawn(
            config,
            fakes.collaborators(),
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            None,
        )
    }

    async fn idle(scheduler: &BatchScheduler) -> BatchSnapshot {
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_until_idle())
            .await
            .expect("batch did not finish")
            .unwrap()
    }

    async fn events_until_complete(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no batch completion")
                .unwrap();
            let done = matches!(event, SchedulerEvent::BatchCompleted(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn started(events: &[SchedulerEvent]) -> Vec<JobId> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::JobStarted { job_id, .. } => Some(*job_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_reports_rejections() {
        let fakes = Fakes::new();
        let scheduler = spawn(&fakes, &test_config(2));

        let report = scheduler
            .enqueue(
                vec![receipt("a.jpg"), receipt("invalid.jpg"), receipt("b.jpg")],
                &[RiskLevel::High],
            )
            .await
            .unwrap();

        assert_eq!(report.job_ids.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].filename, "invalid.jpg");

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.pending_ids().len(), 2);
        assert!(!snapshot.is_processing);
        let first = snapshot.job(report.job_ids[0]).unwrap();
        assert_eq!(first.risk, RiskLevel::High);
        assert_eq!(snapshot.job(report.job_ids[1]).unwrap().risk, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_quota_breach_rejects_whole_call() {
        let fakes = Fakes::new();
        let scheduler = spawn(&fakes, &test_config(2));
        let files: Vec<FileRef> = (0..51).map(|i| receipt(&format!("{}.jpg", i))).collect();

        let result = scheduler.enqueue(files, &[]).await;
        assert!(matches!(result, Err(Error::QuotaExceeded(_))));
        assert!(scheduler.snapshot().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_priority_order_single_slot() {
        let fakes = Fakes::new();
        let scheduler = spawn(&fakes, &test_config(1));
        let report = scheduler
            .enqueue(
                vec![receipt("h1.jpg"), receipt("l.jpg"), receipt("h2.jpg")],
                &[RiskLevel::High, RiskLevel::Low, RiskLevel::High],
            )
            .await
            .unwrap();
        let ids = report.job_ids;

        let mut events = scheduler.subscribe_events();
        assert_eq!(scheduler.start().await.unwrap(), StartOutcome::Started);
        let events = events_until_complete(&mut events).await;

        assert_eq!(started(&events), vec![ids[0], ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn test_end_to_end_mixed_risk() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(20));
        let scheduler = spawn(&fakes, &test_config(2));
        let ids = scheduler
            .enqueue(
                vec![receipt("low.jpg"), receipt("high.jpg"), receipt("medium.jpg")],
                &[RiskLevel::Low, RiskLevel::High, RiskLevel::Medium],
            )
            .await
            .unwrap()
            .job_ids;

        let mut events = scheduler.subscribe_events();
        scheduler.start().await.unwrap();
        let events = events_until_complete(&mut events).await;

        assert_eq!(started(&events), vec![ids[1], ids[2], ids[0]]);
        // The low-risk job only starts once a slot has freed
        let low_start = events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::JobStarted { job_id, .. } if *job_id == ids[0]))
            .unwrap();
        assert!(events[..low_start]
            .iter()
            .any(|e| matches!(e, SchedulerEvent::JobCompleted { .. })));

        let snapshot = idle(&scheduler).await;
        assert_eq!(snapshot.completed_ids.len(), 3);
        tokio_test::assert_ok!(snapshot.check_invariants());

        let metrics = scheduler.metrics();
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.percent, 100.0);
        assert_eq!(metrics.api_calls_total, 3);
        assert_eq!(metrics.tokens_used, 450);

        let summary = scheduler.last_summary().unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(20));
        let scheduler = spawn(&fakes, &test_config(2));
        scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg")], &[])
            .await
            .unwrap();

        let mut events = scheduler.subscribe_events();
        assert_eq!(scheduler.start().await.unwrap(), StartOutcome::Started);
        assert_eq!(scheduler.start().await.unwrap(), StartOutcome::AlreadyRunning);
        let events = events_until_complete(&mut events).await;

        assert_eq!(started(&events).len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::Notice { .. })));
        assert_eq!(fakes.extractor.calls(), 2);
        let completions = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::BatchCompleted(_)))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let fakes = Fakes::new();
        let scheduler = spawn(&fakes, &test_config(2));
        let mut events = scheduler.subscribe_events();

        assert_eq!(scheduler.start().await.unwrap(), StartOutcome::Started);
        let events = events_until_complete(&mut events).await;
        assert_eq!(events.len(), 1);
        assert!(!scheduler.snapshot().is_processing);
    }

    #[tokio::test]
    async fn test_invariants_and_monotonic_progress_hold() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(5));
        fakes.uploader.fail_permanent("bad-1.jpg");
        fakes.uploader.fail_transient("flaky.jpg", 1);
        let scheduler = spawn(&fakes, &test_config(2));

        let mut state = scheduler.subscribe_state();
        let watcher = tokio::spawn(async move {
            let mut last: HashMap<JobId, f32> = HashMap::new();
            let mut observed = 0;
            while state.changed().await.is_ok() {
                let snapshot = state.borrow_and_update().clone();
                snapshot.check_invariants().unwrap();
                assert!(snapshot.active_ids.len() <= 2);
                for job in &snapshot.jobs {
                    let previous = last.insert(job.id, job.progress_percent).unwrap_or(0.0);
                    assert!(job.progress_percent >= previous, "progress went backwards");
                }
                observed += 1;
                if !snapshot.is_processing && observed > 1 && snapshot.pending_ids().is_empty() {
                    break;
                }
            }
            observed
        });

        let files = vec![
            receipt("a.jpg"),
            receipt("bad-1.jpg"),
            receipt("flaky.jpg"),
            receipt("b.jpg"),
            receipt("c.jpg"),
            receipt("d.jpg"),
        ];
        scheduler.enqueue(files, &[]).await.unwrap();
        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;

        assert_eq!(snapshot.completed_ids.len(), 5);
        assert_eq!(snapshot.failed_ids.len(), 1);
        let observed = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(observed > 1);
    }

    #[tokio::test]
    async fn test_rate_limit_backpressure_keeps_uploads_flowing() {
        let fakes = Fakes::new();
        let mut config = test_config(2);
        config.rate_limit = RateLimitConfig {
            requests_per_window: 0,
            max_wait_ms: 5,
            ..Default::default()
        };
        let scheduler = spawn(&fakes, &config);
        scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg"), receipt("c.jpg")], &[])
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;

        assert!(snapshot.completed_ids.is_empty());
        assert_eq!(snapshot.failed_ids.len(), 3);
        for job in &snapshot.jobs {
            assert_eq!(job.failure_kind, Some(FailureKind::RateLimited));
            assert_eq!(job.stage, Stage::Extract);
        }
        assert_eq!(fakes.record_store.marked().len(), 3);
        assert_eq!(fakes.extractor.calls(), 0);
        assert_eq!(scheduler.metrics().rate_limit_events, 3);
    }

    #[tokio::test]
    async fn test_retry_cap() {
        let fakes = Fakes::new();
        fakes.uploader.fail_permanent("a.jpg");
        let scheduler = spawn(&fakes, &test_config(1));
        let first = scheduler.enqueue(vec![receipt("a.jpg")], &[]).await.unwrap().job_ids[0];

        scheduler.start().await.unwrap();
        idle(&scheduler).await;
        let job = scheduler.snapshot().job(first).cloned().unwrap();
        assert_eq!(job.failure_kind, Some(FailureKind::UploadError));

        let second = scheduler.retry(first).await.unwrap();
        scheduler.start().await.unwrap();
        idle(&scheduler).await;

        let third = scheduler.retry(second).await.unwrap();
        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;

        let job = snapshot.job(third).unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(job.original_job_id, first);
        assert_eq!(job.failure_kind, Some(FailureKind::MaxRetriesExceeded));

        let result = scheduler.retry(third).await;
        assert!(matches!(result, Err(Error::MaxRetriesReached { attempts: 3, .. })));
        let after = scheduler.snapshot();
        assert_eq!(after.jobs.len(), 1);
        assert_eq!(after.jobs[0].id, third);
        assert_eq!(fakes.uploader.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_rejects_ineligible_jobs() {
        let fakes = Fakes::new();
        let scheduler = spawn(&fakes, &test_config(1));
        let id = scheduler.enqueue(vec![receipt("a.jpg")], &[]).await.unwrap().job_ids[0];

        assert!(matches!(scheduler.retry(id).await, Err(Error::InvalidState(_))));
        assert!(matches!(
            scheduler.retry(Uuid::new_v4()).await,
            Err(Error::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_extract_wait() {
        let fakes = Fakes::new();
        fakes.extractor.set_mode(ExtractMode::QueueOnly);
        let scheduler = spawn(&fakes, &test_config(1));
        let id = scheduler.enqueue(vec![receipt("a.jpg")], &[]).await.unwrap().job_ids[0];
        scheduler.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fakes.extractor.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(scheduler.cancel(id).await.unwrap(), CancelOutcome::Requested);
        let snapshot = idle(&scheduler).await;
        let job = snapshot.job(id).unwrap();
        assert_eq!(job.failure_kind, Some(FailureKind::Cancelled));
        assert_eq!(job.stage, Stage::Extract);

        // A late push for the record finds nobody listening
        let record_id = job.record_id.clone().unwrap();
        let delivered = fakes.hub.publish(crate::providers::StatusUpdate {
            record_id,
            status: crate::providers::ExtractionStatus::Completed {
                data: serde_json::json!({}),
            },
            usage: None,
        });
        assert_eq!(delivered, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            scheduler.snapshot().job(id).unwrap().failure_kind,
            Some(FailureKind::Cancelled)
        );
        assert!(matches!(scheduler.retry(id).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending_removes_job() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(30));
        let scheduler = spawn(&fakes, &test_config(1));
        let ids = scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg")], &[])
            .await
            .unwrap()
            .job_ids;
        scheduler.start().await.unwrap();

        assert_eq!(scheduler.cancel(ids[1]).await.unwrap(), CancelOutcome::Removed);
        assert!(scheduler.snapshot().job(ids[1]).is_none());

        let snapshot = idle(&scheduler).await;
        assert_eq!(snapshot.jobs.len(), 1);
        assert!(snapshot.completed_ids.contains(&ids[0]));
        assert!(matches!(scheduler.cancel(ids[0]).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_pause_lets_in_flight_finish() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(30));
        let scheduler = spawn(&fakes, &test_config(1));
        let ids = scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg")], &[])
            .await
            .unwrap()
            .job_ids;

        scheduler.start().await.unwrap();
        assert!(scheduler.pause().await.unwrap());
        assert!(!scheduler.pause().await.unwrap());

        let mut state = scheduler.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.completed_ids.contains(&ids[0])),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = scheduler.snapshot();
        assert!(snapshot.is_processing);
        assert!(snapshot.is_paused);
        assert_eq!(snapshot.pending_ids(), vec![ids[1]]);

        assert_eq!(scheduler.start().await.unwrap(), StartOutcome::Resumed);
        let snapshot = idle(&scheduler).await;
        assert_eq!(snapshot.completed_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_all_rejected_while_running() {
        let fakes = Fakes::new();
        fakes.uploader.set_delay(Duration::from_millis(30));
        let scheduler = spawn(&fakes, &test_config(1));
        scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg")], &[])
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        assert!(matches!(scheduler.clear_all().await, Err(Error::InvalidState(_))));

        scheduler.pause().await.unwrap();
        // The pending job goes now; the active one is cancelled
        assert_eq!(scheduler.clear_all().await.unwrap(), 1);
        let snapshot = idle(&scheduler).await;
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].failure_kind, Some(FailureKind::Cancelled));

        assert_eq!(scheduler.clear_all().await.unwrap(), 1);
        assert!(scheduler.snapshot().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_failures() {
        let fakes = Fakes::new();
        fakes.uploader.fail_permanent("bad.jpg");
        let scheduler = spawn(&fakes, &test_config(2));
        scheduler
            .enqueue(vec![receipt("ok.jpg"), receipt("bad.jpg")], &[])
            .await
            .unwrap();
        scheduler.start().await.unwrap();
        idle(&scheduler).await;

        assert_eq!(scheduler.clear_completed().await.unwrap(), 1);
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].filename, "bad.jpg");
        assert!(snapshot.completed_ids.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_isolated() {
        let fakes = Fakes::new();
        fakes.uploader.panic_on("boom.jpg");
        let scheduler = spawn(&fakes, &test_config(2));
        let ids = scheduler
            .enqueue(vec![receipt("boom.jpg"), receipt("ok.jpg")], &[])
            .await
            .unwrap()
            .job_ids;

        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;

        let boom = snapshot.job(ids[0]).unwrap();
        assert_eq!(boom.failure_kind, Some(FailureKind::ProcessingError));
        assert_eq!(boom.stage, Stage::Upload);
        assert!(snapshot.completed_ids.contains(&ids[1]));

        let summary = scheduler.last_summary().unwrap();
        assert_eq!(summary.failures_of(FailureKind::ProcessingError), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_for_delay_and_keeps_priority() {
        let fakes = Fakes::new();
        fakes.uploader.fail_transient("a.jpg", 3);
        let mut config = test_config(1);
        config.retry.base_delay_ms = 40;
        let scheduler = spawn(&fakes, &config);
        let first = scheduler
            .enqueue(vec![receipt("a.jpg")], &[RiskLevel::High])
            .await
            .unwrap()
            .job_ids[0];
        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;
        assert_eq!(
            snapshot.job(first).unwrap().failure_kind,
            Some(FailureKind::TransientNetworkError)
        );

        let retried_at = Instant::now();
        let second = scheduler.retry(first).await.unwrap();
        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;

        assert!(retried_at.elapsed() >= Duration::from_millis(40));
        let job = snapshot.job(second).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.priority, RiskLevel::High.priority());
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn test_transient_upload_failures_exhaust_retries() {
        let fakes = Fakes::new();
        fakes.uploader.fail_transient("a.jpg", 100);
        let scheduler = spawn(&fakes, &test_config(1));
        let mut job_id = scheduler.enqueue(vec![receipt("a.jpg")], &[]).await.unwrap().job_ids[0];

        for attempt in 1..=3u32 {
            scheduler.start().await.unwrap();
            let snapshot = idle(&scheduler).await;
            let job = snapshot.job(job_id).unwrap();
            assert_eq!(job.attempt, attempt);
            if attempt < 3 {
                assert_eq!(job.failure_kind, Some(FailureKind::TransientNetworkError));
                job_id = scheduler.retry(job_id).await.unwrap();
            } else {
                assert_eq!(job.failure_kind, Some(FailureKind::MaxRetriesExceeded));
            }
        }

        let result = scheduler.retry(job_id).await;
        assert!(matches!(result, Err(Error::MaxRetriesReached { attempts: 3, .. })));
        assert_eq!(scheduler.snapshot().jobs.len(), 1);
        // Three stage attempts per admission
        assert_eq!(fakes.uploader.calls(), 9);
    }

    #[tokio::test]
    async fn test_cancelled_last_attempt_is_not_a_retry_cap() {
        let fakes = Fakes::new();
        fakes.uploader.fail_transient("a.jpg", 6);
        fakes.extractor.set_mode(ExtractMode::QueueOnly);
        let scheduler = spawn(&fakes, &test_config(1));
        let mut job_id = scheduler.enqueue(vec![receipt("a.jpg")], &[]).await.unwrap().job_ids[0];

        for _ in 0..2 {
            scheduler.start().await.unwrap();
            idle(&scheduler).await;
            job_id = scheduler.retry(job_id).await.unwrap();
        }
        scheduler.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while fakes.extractor.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(scheduler.cancel(job_id).await.unwrap(), CancelOutcome::Requested);

        let snapshot = idle(&scheduler).await;
        let job = snapshot.job(job_id).unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(job.failure_kind, Some(FailureKind::Cancelled));
        assert!(matches!(scheduler.retry(job_id).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_each_run_summarizes_only_its_own_jobs() {
        let fakes = Fakes::new();
        fakes.uploader.fail_transient("b.jpg", 3);
        let scheduler = spawn(&fakes, &test_config(2));
        let ids = scheduler
            .enqueue(vec![receipt("a.jpg"), receipt("b.jpg")], &[])
            .await
            .unwrap()
            .job_ids;

        scheduler.start().await.unwrap();
        idle(&scheduler).await;
        let first = scheduler.last_summary().unwrap();
        assert_eq!((first.total_files, first.succeeded, first.failed), (2, 1, 1));
        assert_eq!(first.api_calls_total, 1);
        assert_eq!(first.tokens_used, 150);
        assert_eq!(first.failures_of(FailureKind::TransientNetworkError), 1);

        scheduler.retry(ids[1]).await.unwrap();
        scheduler.start().await.unwrap();
        let snapshot = idle(&scheduler).await;
        let second = scheduler.last_summary().unwrap();

        assert_ne!(second.batch_id, first.batch_id);
        assert_eq!(second.batch_id, snapshot.batch_id);
        assert_eq!((second.total_files, second.succeeded, second.failed), (1, 1, 0));
        assert_eq!(second.api_calls_total, 1);
        assert_eq!(second.tokens_used, 150);
        assert!(second.failures_by_kind.is_empty());
        assert_eq!(second.error_rate, 0.0);
        // The queue itself still holds both files
        assert_eq!(snapshot.completed_ids.len(), 2);
        assert_eq!(fakes.extractor.calls(), 2);
    }
}
