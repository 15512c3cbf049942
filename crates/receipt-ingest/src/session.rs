//! Batch session history
//!
//! The scheduler hands every finished batch summary to the recorder. Writes
//! happen on a spawned task so a slow store never stalls scheduling, and a
//! failed write is logged, not surfaced to the batch.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::providers::SessionStore;
use crate::types::BatchSummary;

#[derive(Clone)]
pub struct SessionRecorder {
    store: Arc<dyn SessionStore>,
}

impl SessionRecorder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Persist a summary in the background
    pub fn record(&self, summary: BatchSummary) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.save_session(&summary).await {
                Ok(()) => tracing::info!(
                    "Recorded session {} ({} ok, {} failed) in {}",
                    summary.batch_id,
                    summary.succeeded,
                    summary.failed,
                    store.name()
                ),
                Err(e) => tracing::error!("Failed to record session {}: {}", summary.batch_id, e),
            }
        })
    }

    /// Most recent sessions first
    pub async fn recent(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        self.store.list_sessions(limit).await
    }
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::ReceiptDb;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn summary(succeeded: usize) -> BatchSummary {
        BatchSummary {
            batch_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 10,
            total_files: succeeded,
            succeeded,
            failed: 0,
            failures_by_kind: BTreeMap::new(),
            api_calls_total: succeeded as u64,
            tokens_used: 0,
            estimated_cost: 0.0,
            error_rate: 0.0,
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn save_session(&self, _summary: &BatchSummary) -> Result<()> {
            Err(Error::internal("disk full"))
        }

        async fn list_sessions(&self, _limit: usize) -> Result<Vec<BatchSummary>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_records_to_store() {
        let recorder = SessionRecorder::new(Arc::new(ReceiptDb::in_memory().unwrap()));
        let first = summary(3);

        recorder.record(first.clone()).await.unwrap();
        recorder.record(summary(5)).await.unwrap();

        let sessions = recorder.recent(1).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(recorder.recent(10).await.unwrap().len(), 2);
        assert!(recorder
            .recent(10)
            .await
            .unwrap()
            .iter()
            .any(|s| s.batch_id == first.batch_id && s.succeeded == 3));
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let recorder = SessionRecorder::new(Arc::new(BrokenStore));
        tokio_test::assert_ok!(recorder.record(summary(1)).await);
    }
}
