//! Job processing: scheduling, per-job pipelines, retries and progress

pub mod pipeline;
pub mod progress;
pub mod race;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{JobContext, JobPipeline, PipelineEvent, PipelineFailure, PipelineSuccess};
pub use progress::ProgressAggregator;
pub use race::{cancel_pair, CancelHandle, CancelSignal};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::BatchScheduler;
