//! Per-job stage pipeline
//!
//! A pipeline runs one job through Validate → Optimize → Upload → Persist →
//! MarkUploaded → Extract. It never touches batch state: everything it
//! learns is sent to the scheduler as a `PipelineEvent`, and its return
//! value is the job's terminal outcome.

use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::race::{first_terminal, CancelSignal, RaceOutcome, Source};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::providers::{
    Collaborators, ExtractionOutcome, ExtractionStatus, RecordMeta, Validation,
};
use crate::rate_limit::RateLimiter;
use crate::types::{
    FailureKind, FileRef, JobId, ProgressEvent, RecordId, RiskLevel, Stage, TokenUsage,
};

/// What a running pipeline reports back to the scheduler
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageChanged { job_id: JobId, stage: Stage },
    Progress(ProgressEvent),
    RecordCreated { job_id: JobId, record_id: RecordId },
    ApiCall { job_id: JobId, usage: Option<TokenUsage> },
    RateLimited { job_id: JobId },
}

/// Everything a pipeline needs to know about its job
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub original_job_id: JobId,
    pub attempt: u32,
    pub file: FileRef,
    pub risk: RiskLevel,
    pub cancel: CancelSignal,
}

/// Successful pipeline result
#[derive(Debug, Clone)]
pub struct PipelineSuccess {
    pub record_id: RecordId,
    pub data: serde_json::Value,
    pub usage: Option<TokenUsage>,
}

/// Terminal pipeline failure
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub stage: Stage,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(kind: FailureKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }

    fn cancelled(stage: Stage) -> Self {
        Self::new(FailureKind::Cancelled, stage, "cancelled by user")
    }
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.stage, self.message)
    }
}

pub type PipelineResult = std::result::Result<PipelineSuccess, PipelineFailure>;

/// Sends events for one job, keeping emitted percent non-decreasing
struct Emitter {
    job_id: JobId,
    tx: mpsc::UnboundedSender<PipelineEvent>,
    last_percent: Mutex<f32>,
}

impl Emitter {
    fn send(&self, event: PipelineEvent) {
        // A closed channel means the scheduler is gone; nothing left to tell
        let _ = self.tx.send(event);
    }

    fn stage(&self, stage: Stage) {
        self.send(PipelineEvent::StageChanged {
            job_id: self.job_id,
            stage,
        });
        self.progress(stage, stage.percent_at(0.0));
    }

    fn progress(&self, stage: Stage, percent: f32) {
        {
            let mut last = self.last_percent.lock();
            if percent <= *last {
                return;
            }
            *last = percent;
        }
        self.send(PipelineEvent::Progress(ProgressEvent {
            job_id: self.job_id,
            stage,
            percent,
            timestamp: chrono::Utc::now(),
        }));
    }
}

/// Runs jobs through the stage sequence
#[derive(Clone)]
pub struct JobPipeline {
    collaborators: Collaborators,
    limiter: Arc<RateLimiter>,
    config: PipelineConfig,
}

impl JobPipeline {
    pub fn new(collaborators: Collaborators, limiter: Arc<RateLimiter>, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            limiter,
            config,
        }
    }

    /// Run one job to its terminal outcome
    pub async fn run(&self, ctx: JobContext, events: mpsc::UnboundedSender<PipelineEvent>) -> PipelineResult {
        let emitter = Emitter {
            job_id: ctx.job_id,
            tx: events,
            last_percent: Mutex::new(0.0),
        };

        let result = self.run_stages(&ctx, &emitter).await;
        match &result {
            Ok(success) => {
                emitter.stage(Stage::Done);
                tracing::info!(
                    job_id = %ctx.job_id,
                    record_id = %success.record_id,
                    "Job {} finished",
                    ctx.file.filename
                );
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                tracing::info!(job_id = %ctx.job_id, stage = %failure.stage, "Job cancelled");
            }
            Err(failure) => {
                tracing::error!(
                    job_id = %ctx.job_id,
                    stage = %failure.stage,
                    attempt = ctx.attempt,
                    "Job {} failed: {}",
                    ctx.file.filename,
                    failure
                );
            }
        }
        result
    }

    fn checkpoint(&self, ctx: &JobContext, next: Stage, emitter: &Emitter) -> std::result::Result<(), PipelineFailure> {
        if ctx.cancel.is_cancelled() {
            return Err(PipelineFailure::cancelled(next));
        }
        emitter.stage(next);
        Ok(())
    }

    async fn run_stages(&self, ctx: &JobContext, emitter: &Emitter) -> PipelineResult {
        let c = &self.collaborators;

        // Validate
        self.checkpoint(ctx, Stage::Validate, emitter)?;
        if let Validation::Invalid(reason) = c.validator.check(&ctx.file).await {
            return Err(PipelineFailure::new(FailureKind::ValidationError, Stage::Validate, reason));
        }

        // Optimize: best effort
        self.checkpoint(ctx, Stage::Optimize, emitter)?;
        let file = match c.optimizer.transform(&ctx.file).await {
            Ok(optimized) => {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    "Optimized {}: {} -> {} bytes",
                    ctx.file.filename,
                    ctx.file.size(),
                    optimized.size()
                );
                optimized
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, "Optimization failed, using original: {}", e);
                ctx.file.clone()
            }
        };

        // Upload
        self.checkpoint(ctx, Stage::Upload, emitter)?;
        let on_progress = |fraction: f32| emitter.progress(Stage::Upload, Stage::Upload.percent_at(fraction));
        let url = self
            .with_stage_retries(ctx, Stage::Upload, FailureKind::UploadError, || {
                c.uploader.put(&file, &on_progress)
            })
            .await?;

        // Persist
        self.checkpoint(ctx, Stage::Persist, emitter)?;
        let meta = RecordMeta {
            job_id: ctx.job_id,
            original_job_id: ctx.original_job_id,
            filename: file.filename.clone(),
            content_hash: file.content_hash(),
            size_bytes: file.size(),
            url,
            content_type: file.content_type.clone(),
            risk: ctx.risk,
        };
        let record_id = self
            .with_stage_retries(ctx, Stage::Persist, FailureKind::PersistError, || {
                c.record_store.create(&meta)
            })
            .await?;
        emitter.send(PipelineEvent::RecordCreated {
            job_id: ctx.job_id,
            record_id: record_id.clone(),
        });

        // MarkUploaded: single attempt, no rollback of the record
        self.checkpoint(ctx, Stage::MarkUploaded, emitter)?;
        c.record_store
            .mark_uploaded(&record_id)
            .await
            .map_err(|e| PipelineFailure::new(FailureKind::PersistError, Stage::MarkUploaded, e.to_string()))?;

        // Extract
        self.checkpoint(ctx, Stage::Extract, emitter)?;
        self.extract(ctx, emitter, record_id).await
    }

    /// Retry transient errors with linear backoff, up to `stage_attempts`
    async fn with_stage_retries<T, F, Fut>(
        &self,
        ctx: &JobContext,
        stage: Stage,
        kind: FailureKind,
        mut op: F,
    ) -> std::result::Result<T, PipelineFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.stage_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.stage_backoff() * attempt;
                    tracing::warn!(
                        job_id = %ctx.job_id,
                        stage = %stage,
                        attempt,
                        "Transient error, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    if ctx.cancel.is_cancelled() {
                        return Err(PipelineFailure::cancelled(stage));
                    }
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(PipelineFailure::new(
                        FailureKind::TransientNetworkError,
                        stage,
                        format!("gave up after {} attempts: {}", attempts, e),
                    ));
                }
                Err(e) => return Err(PipelineFailure::new(kind, stage, e.to_string())),
            }
        }
    }

    async fn extract(&self, ctx: &JobContext, emitter: &Emitter, record_id: RecordId) -> PipelineResult {
        let estimated = self.config.estimated_tokens_per_job;

        if let Err(e) = self.limiter.acquire(estimated).await {
            if e.is_rate_limited() {
                emitter.send(PipelineEvent::RateLimited { job_id: ctx.job_id });
                return Err(PipelineFailure::new(FailureKind::RateLimited, Stage::Extract, e.to_string()));
            }
            return Err(PipelineFailure::new(FailureKind::ProcessingError, Stage::Extract, e.to_string()));
        }
        if ctx.cancel.is_cancelled() {
            self.limiter.release(estimated).await;
            return Err(PipelineFailure::cancelled(Stage::Extract));
        }
        emitter.progress(Stage::Extract, Stage::Extract.percent_at(0.1));

        // Subscribe before calling so a fast push cannot be missed
        let pushes = match self.collaborators.status_push.subscribe(&record_id).await {
            Ok(stream) => stream
                .map(|update| ExtractionOutcome {
                    status: update.status,
                    usage: update.usage,
                })
                .boxed(),
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, "Status push unavailable, relying on direct result: {}", e);
                futures::stream::empty().boxed()
            }
        };

        // The direct call runs detached: if the race ends first (cancel,
        // timeout, push) the call still completes and its result is dropped
        let extractor = self.collaborators.extractor.clone();
        let model = self.config.model_hint.clone();
        let call_record = record_id.clone();
        let handle = tokio::spawn(async move { extractor.process(&call_record, &model).await });
        let direct = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("extraction task failed: {}", e))),
            }
        };

        let mut cancel = ctx.cancel.clone();
        let outcome = first_terminal(
            direct,
            pushes,
            |o: &ExtractionOutcome| o.status.is_terminal(),
            &mut cancel,
            self.config.extract_timeout(),
        )
        .await;

        match outcome {
            RaceOutcome::Terminal { value, source } => {
                emitter.send(PipelineEvent::ApiCall {
                    job_id: ctx.job_id,
                    usage: value.usage,
                });
                self.limiter.record_success(estimated, value.usage);
                tracing::debug!(
                    job_id = %ctx.job_id,
                    "Extraction resolved via {}",
                    if source == Source::Direct { "direct return" } else { "status push" }
                );
                match value.status {
                    ExtractionStatus::Completed { data } => {
                        emitter.progress(Stage::Extract, Stage::Extract.percent_at(1.0));
                        Ok(PipelineSuccess {
                            record_id,
                            data,
                            usage: value.usage,
                        })
                    }
                    ExtractionStatus::Failed { reason } => Err(PipelineFailure::new(
                        FailureKind::ProcessingError,
                        Stage::Extract,
                        reason,
                    )),
                    other => Err(PipelineFailure::new(
                        FailureKind::ProcessingError,
                        Stage::Extract,
                        format!("unexpected terminal status {:?}", other),
                    )),
                }
            }
            RaceOutcome::DirectFailed(e) if e.is_rate_limited() => {
                emitter.send(PipelineEvent::ApiCall {
                    job_id: ctx.job_id,
                    usage: None,
                });
                emitter.send(PipelineEvent::RateLimited { job_id: ctx.job_id });
                self.limiter.record_failure(&e);
                Err(PipelineFailure::new(FailureKind::RateLimited, Stage::Extract, e.to_string()))
            }
            RaceOutcome::DirectFailed(e) => {
                emitter.send(PipelineEvent::ApiCall {
                    job_id: ctx.job_id,
                    usage: None,
                });
                Err(PipelineFailure::new(FailureKind::ProcessingError, Stage::Extract, e.to_string()))
            }
            RaceOutcome::Cancelled => Err(PipelineFailure::cancelled(Stage::Extract)),
            RaceOutcome::TimedOut => Err(PipelineFailure::new(
                FailureKind::ProcessingError,
                Stage::Extract,
                format!("extraction did not finish within {:?}", self.config.extract_timeout()),
            )),
            RaceOutcome::Exhausted => Err(PipelineFailure::new(
                FailureKind::ProcessingError,
                Stage::Extract,
                "status channel closed before extraction finished",
            )),
        }
    }
}
