//! Batch progress aggregation
//!
//! The aggregator is owned by the scheduler actor and is its only writer.
//! Each job keeps a true target percent (what the pipeline last reported)
//! and a displayed percent that walks toward the target over a fixed number
//! of ticks. Batch metrics are derived from the targets, so they do not
//! depend on tick timing.
//!
//! Every method takes `now` explicitly; the scheduler passes
//! `Instant::now()` and tests pass constructed instants.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ProgressConfig;
use crate::types::{Alert, FailureKind, JobId, ProgressEvent, ProgressMetrics, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackedState {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Smoothed progress of one job
#[derive(Debug, Clone)]
pub struct SmoothedProgress {
    target: f32,
    displayed: f32,
    ticks_left: u32,
}

impl SmoothedProgress {
    fn new() -> Self {
        Self {
            target: 0.0,
            displayed: 0.0,
            ticks_left: 0,
        }
    }

    /// Raise the target; lower targets are ignored
    fn retarget(&mut self, target: f32, ticks: u32) {
        let target = target.clamp(0.0, 100.0);
        if target > self.target {
            self.target = target;
            self.ticks_left = ticks.max(1);
        }
    }

    fn tick(&mut self) -> bool {
        if self.ticks_left == 0 {
            return false;
        }
        let step = (self.target - self.displayed) / self.ticks_left as f32;
        self.ticks_left -= 1;
        self.displayed = if self.ticks_left == 0 {
            self.target
        } else {
            (self.displayed + step).min(self.target)
        };
        true
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn displayed(&self) -> f32 {
        self.displayed
    }
}

#[derive(Debug, Clone)]
struct TrackedJob {
    state: TrackedState,
    progress: SmoothedProgress,
}

/// Aggregates per-job events into batch metrics and alerts
#[derive(Debug)]
pub struct ProgressAggregator {
    config: ProgressConfig,
    jobs: HashMap<JobId, TrackedJob>,
    started_at: Option<Instant>,
    completions: VecDeque<Instant>,
    /// Most recent terminal outcomes, true = failure
    outcomes: VecDeque<bool>,
    rate_limit_events: VecDeque<Instant>,
    rate_limit_total: u64,
    api_calls_total: u64,
    tokens_used: u64,
    error_alert_active: bool,
    rate_limit_alert_active: bool,
    pending_alerts: Vec<Alert>,
}

impl ProgressAggregator {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            jobs: HashMap::new(),
            started_at: None,
            completions: VecDeque::new(),
            outcomes: VecDeque::new(),
            rate_limit_events: VecDeque::new(),
            rate_limit_total: 0,
            api_calls_total: 0,
            tokens_used: 0,
            error_alert_active: false,
            rate_limit_alert_active: false,
            pending_alerts: Vec::new(),
        }
    }

    /// Start tracking an admitted job
    pub fn track(&mut self, job_id: JobId) {
        self.jobs.entry(job_id).or_insert(TrackedJob {
            state: TrackedState::Pending,
            progress: SmoothedProgress::new(),
        });
    }

    /// Stop tracking a removed job
    pub fn forget(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }

    /// Drop per-run counters; called when a fresh run starts
    ///
    /// Job tracking survives so the queue view stays whole, but call, token,
    /// cost and error-rate figures only cover the new run.
    pub fn reset_run(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.completions.clear();
        self.outcomes.clear();
        self.rate_limit_events.clear();
        self.rate_limit_total = 0;
        self.api_calls_total = 0;
        self.tokens_used = 0;
        self.error_alert_active = false;
        self.rate_limit_alert_active = false;
    }

    pub fn job_started(&mut self, job_id: JobId, now: Instant) {
        self.started_at.get_or_insert(now);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = TrackedState::Active;
        }
    }

    /// Apply a pipeline progress event
    pub fn record(&mut self, event: &ProgressEvent) {
        let ticks = self.config.smoothing_ticks;
        if let Some(job) = self.jobs.get_mut(&event.job_id) {
            if job.state == TrackedState::Active {
                job.progress.retarget(event.percent, ticks);
            }
        }
    }

    pub fn job_completed(&mut self, job_id: JobId, now: Instant) {
        let ticks = self.config.smoothing_ticks;
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = TrackedState::Completed;
            job.progress.retarget(100.0, ticks);
        }
        self.completions.push_back(now);
        self.push_outcome(false);
    }

    pub fn job_failed(&mut self, job_id: JobId, kind: FailureKind) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = TrackedState::Failed;
            // Freeze the display where it is
            job.progress.ticks_left = 0;
            job.progress.target = job.progress.displayed;
        }
        if kind.counts_as_error() {
            self.push_outcome(true);
        }
    }

    /// Count one extraction API call and its reported usage
    pub fn record_api_call(&mut self, usage: Option<TokenUsage>) {
        self.api_calls_total += 1;
        if let Some(usage) = usage {
            self.tokens_used += usage.total() as u64;
        }
    }

    pub fn record_rate_limit(&mut self, now: Instant) {
        self.rate_limit_total += 1;
        self.rate_limit_events.push_back(now);
        self.check_rate_limit_alert(now);
    }

    fn push_outcome(&mut self, failed: bool) {
        self.outcomes.push_back(failed);
        while self.outcomes.len() > self.config.error_window.max(1) {
            self.outcomes.pop_front();
        }
        self.check_error_alert();
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|f| **f).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn check_error_alert(&mut self) {
        let rate = self.error_rate();
        let alerting = self.outcomes.len() >= self.config.error_min_samples
            && rate > self.config.error_rate_threshold;
        if alerting && !self.error_alert_active {
            self.pending_alerts.push(Alert::HighErrorRate {
                error_rate: rate,
                window: self.outcomes.len(),
            });
        }
        self.error_alert_active = alerting;
    }

    fn check_rate_limit_alert(&mut self, now: Instant) {
        let window = Duration::from_secs(self.config.rate_limit_window_secs);
        while let Some(front) = self.rate_limit_events.front() {
            if now.saturating_duration_since(*front) > window {
                self.rate_limit_events.pop_front();
            } else {
                break;
            }
        }
        let events = self.rate_limit_events.len();
        let alerting = events >= self.config.rate_limit_alert_threshold.max(1);
        if alerting && !self.rate_limit_alert_active {
            self.pending_alerts.push(Alert::RepeatedRateLimiting {
                events,
                window_secs: self.config.rate_limit_window_secs,
            });
        }
        self.rate_limit_alert_active = alerting;
    }

    /// Alerts raised since the last call
    pub fn take_alerts(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.pending_alerts)
    }

    /// Advance every job's display by one tick; returns whether anything moved
    pub fn tick(&mut self) -> bool {
        let mut moved = false;
        for job in self.jobs.values_mut() {
            moved |= job.progress.tick();
        }
        moved
    }

    /// Whether any job is still animating toward its target
    pub fn is_animating(&self) -> bool {
        self.jobs.values().any(|j| j.progress.ticks_left > 0)
    }

    pub fn display_percent(&self, job_id: JobId) -> f32 {
        self.jobs
            .get(&job_id)
            .map(|j| j.progress.displayed())
            .unwrap_or(0.0)
    }

    pub fn estimated_cost(&self) -> f64 {
        self.tokens_used as f64 / 1000.0 * self.config.cost_per_1k_tokens
            + self.api_calls_total as f64 * self.config.cost_per_call
    }

    fn throughput_per_minute(&mut self, now: Instant) -> f64 {
        let window = Duration::from_secs(self.config.throughput_window_secs.max(1));
        while let Some(front) = self.completions.front() {
            if now.saturating_duration_since(*front) > window {
                self.completions.pop_front();
            } else {
                break;
            }
        }
        if self.completions.is_empty() {
            return 0.0;
        }
        // Young runs measure over their real age, not the full window
        let age = self
            .started_at
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or(window);
        let span = age.min(window).max(Duration::from_secs(1));
        self.completions.len() as f64 / (span.as_secs_f64() / 60.0)
    }

    /// Recompute batch metrics
    pub fn metrics(&mut self, now: Instant) -> ProgressMetrics {
        let mut completed = 0;
        let mut failed = 0;
        let mut active = 0;
        let mut pending = 0;
        let mut percent_sum = 0.0f64;
        let mut remaining_work = 0.0f64;

        for job in self.jobs.values() {
            match job.state {
                TrackedState::Completed => {
                    completed += 1;
                    percent_sum += 100.0;
                }
                TrackedState::Failed => failed += 1,
                TrackedState::Active => {
                    active += 1;
                    percent_sum += job.progress.target() as f64;
                    remaining_work += (100.0 - job.progress.target() as f64) / 100.0;
                }
                TrackedState::Pending => {
                    pending += 1;
                    remaining_work += 1.0;
                }
            }
        }

        let total_files = self.jobs.len();
        let percent = if total_files == 0 {
            0.0
        } else {
            (percent_sum / total_files as f64) as f32
        };

        let throughput = self.throughput_per_minute(now);
        let eta_seconds = if throughput > 0.0 {
            Some(remaining_work / throughput * 60.0)
        } else {
            None
        };

        ProgressMetrics {
            total_files,
            completed,
            failed,
            active,
            pending,
            percent,
            throughput_per_minute: throughput,
            eta_seconds,
            api_calls_total: self.api_calls_total,
            tokens_used: self.tokens_used,
            estimated_cost: self.estimated_cost(),
            error_rate: self.error_rate(),
            rate_limit_events: self.rate_limit_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stage;
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> ProgressConfig {
        ProgressConfig {
            smoothing_ticks: 4,
            throughput_window_secs: 60,
            error_window: 4,
            error_min_samples: 2,
            error_rate_threshold: 0.4,
            rate_limit_alert_threshold: 2,
            rate_limit_window_secs: 10,
            cost_per_1k_tokens: 0.5,
            cost_per_call: 0.01,
        }
    }

    fn event(job_id: JobId, stage: Stage, percent: f32) -> ProgressEvent {
        ProgressEvent {
            job_id,
            stage,
            percent,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_smoothing_never_overshoots_or_regresses() {
        let mut progress = SmoothedProgress::new();
        progress.retarget(40.0, 4);

        let mut last = 0.0;
        for _ in 0..4 {
            progress.tick();
            assert!(progress.displayed() >= last);
            assert!(progress.displayed() <= 40.0);
            last = progress.displayed();
        }
        assert_eq!(progress.displayed(), 40.0);

        progress.retarget(10.0, 4);
        assert_eq!(progress.target(), 40.0);
        assert!(!progress.tick());
    }

    #[tokio::test]
    async fn test_metrics_percent_and_counts() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [a, b, c] {
            agg.track(id);
        }
        agg.reset_run(now);
        agg.job_started(a, now);
        agg.job_started(b, now);
        agg.record(&event(b, Stage::Upload, 50.0));
        agg.job_completed(a, now);
        agg.job_failed(b, FailureKind::UploadError);

        let metrics = agg.metrics(now + Duration::from_secs(30));
        assert_eq!(metrics.total_files, 3);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.pending, 1);
        // (100 + 0 + 0) / 3
        assert!((metrics.percent - 33.333).abs() < 0.01);
        // One completion over 30s
        assert!((metrics.throughput_per_minute - 2.0).abs() < 1e-9);
        // One pending job left at 2/min
        assert!((metrics.eta_seconds.unwrap() - 30.0).abs() < 1e-9);
        assert!((metrics.error_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_eta_unknown_without_throughput() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        agg.track(Uuid::new_v4());
        let metrics = agg.metrics(now);
        assert_eq!(metrics.throughput_per_minute, 0.0);
        assert!(metrics.eta_seconds.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_jobs_do_not_count_as_errors() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            agg.track(*id);
            agg.job_started(*id, now);
        }
        agg.job_failed(ids[0], FailureKind::Cancelled);
        agg.job_completed(ids[1], now);
        assert_eq!(agg.metrics(now).error_rate, 0.0);
    }

    #[tokio::test]
    async fn test_error_alert_is_edge_triggered() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        let ids: Vec<JobId> = (0..6).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            agg.track(*id);
            agg.job_started(*id, now);
        }

        agg.job_failed(ids[0], FailureKind::UploadError);
        assert!(agg.take_alerts().is_empty(), "below min samples");
        agg.job_failed(ids[1], FailureKind::UploadError);
        let alerts = agg.take_alerts();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0], Alert::HighErrorRate { .. }));

        agg.job_failed(ids[2], FailureKind::PersistError);
        assert!(agg.take_alerts().is_empty(), "still alerting, no repeat");

        // Window of 4: [F, F, F, ok] -> [F, ok, ok, ok] drops below threshold
        for id in &ids[3..6] {
            agg.job_completed(*id, now);
        }
        assert!((agg.metrics(now).error_rate - 0.25).abs() < 1e-9);
        assert!(agg.take_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_alert_and_cost() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());

        agg.record_rate_limit(now);
        assert!(agg.take_alerts().is_empty());
        agg.record_rate_limit(now + Duration::from_secs(1));
        assert_eq!(
            agg.take_alerts(),
            vec![Alert::RepeatedRateLimiting {
                events: 2,
                window_secs: 10
            }]
        );
        // Outside the window the count starts over
        agg.record_rate_limit(now + Duration::from_secs(30));
        assert!(agg.take_alerts().is_empty());

        agg.record_api_call(Some(TokenUsage {
            prompt_tokens: 1500,
            completion_tokens: 500,
        }));
        agg.record_api_call(None);
        let metrics = agg.metrics(now);
        assert_eq!(metrics.api_calls_total, 2);
        assert_eq!(metrics.tokens_used, 2000);
        assert_eq!(metrics.rate_limit_events, 3);
        // 2k tokens * 0.5 + 2 calls * 0.01
        assert!((metrics.estimated_cost - 1.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_display_follows_events() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        let id = Uuid::new_v4();
        agg.track(id);
        agg.job_started(id, now);
        agg.record(&event(id, Stage::Upload, 20.0));

        assert_eq!(agg.display_percent(id), 0.0);
        assert!(agg.is_animating());
        while agg.tick() {}
        assert_eq!(agg.display_percent(id), 20.0);
        assert!(!agg.is_animating());
    }

    #[tokio::test]
    async fn test_new_run_starts_counters_over() {
        let now = Instant::now();
        let mut agg = ProgressAggregator::new(config());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        agg.track(a);
        agg.job_started(a, now);
        agg.record_api_call(Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        }));
        agg.record_rate_limit(now);
        agg.job_failed(a, FailureKind::UploadError);

        agg.reset_run(now + Duration::from_secs(5));
        agg.track(b);
        agg.job_started(b, now + Duration::from_secs(5));
        agg.record_api_call(None);
        agg.job_completed(b, now + Duration::from_secs(6));

        let metrics = agg.metrics(now + Duration::from_secs(6));
        assert_eq!(metrics.api_calls_total, 1);
        assert_eq!(metrics.tokens_used, 0);
        assert_eq!(metrics.rate_limit_events, 0);
        assert_eq!(metrics.error_rate, 0.0);
        // Both jobs are still tracked
        assert_eq!(metrics.total_files, 2);
    }
}
