//! Resolve on the first terminal signal from two completion paths
//!
//! An extraction can finish through its direct return value or through a
//! pushed status update, whichever arrives first. `first_terminal` races the
//! two against a cancellation signal and a deadline. Whatever loses is
//! dropped; a direct call that must keep running should be spawned by the
//! caller so that dropping its handle only detaches it.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Error;

/// Sending half of a cooperative cancellation flag
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half, checked by pipelines at stage boundaries
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; never resolves if the handle is gone
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancellation handle and signal
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle {
            tx: std::sync::Arc::new(tx),
        },
        CancelSignal { rx },
    )
}

/// Which path delivered the terminal value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Direct,
    Push,
}

/// Result of a race
#[derive(Debug)]
pub enum RaceOutcome<T> {
    Terminal { value: T, source: Source },
    /// The direct call failed before any terminal value arrived
    DirectFailed(Error),
    Cancelled,
    TimedOut,
    /// Both paths finished without a terminal value
    Exhausted,
}

/// Wait for the first value accepted by `is_terminal` from either path
pub async fn first_terminal<T, D, F>(
    direct: D,
    mut pushes: BoxStream<'static, T>,
    is_terminal: F,
    cancel: &mut CancelSignal,
    limit: Duration,
) -> RaceOutcome<T>
where
    D: Future<Output = crate::error::Result<T>>,
    F: Fn(&T) -> bool,
{
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    tokio::pin!(direct);

    let mut direct_done = false;
    let mut pushes_done = false;

    loop {
        if direct_done && pushes_done {
            return RaceOutcome::Exhausted;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return RaceOutcome::Cancelled,

            result = &mut direct, if !direct_done => {
                direct_done = true;
                match result {
                    Ok(value) if is_terminal(&value) => {
                        return RaceOutcome::Terminal { value, source: Source::Direct };
                    }
                    Ok(_) => tracing::debug!("Direct call accepted, waiting for status push"),
                    Err(e) => return RaceOutcome::DirectFailed(e),
                }
            }

            update = pushes.next(), if !pushes_done => match update {
                Some(value) if is_terminal(&value) => {
                    return RaceOutcome::Terminal { value, source: Source::Push };
                }
                Some(_) => {}
                None => pushes_done = true,
            },

            _ = &mut deadline => return RaceOutcome::TimedOut,
        }
    }
}
