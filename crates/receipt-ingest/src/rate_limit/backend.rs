//! Shared quota backend for budgets spanning several sessions

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Answer from a shared quota store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub granted: bool,
    /// How long until the shared window has room again (zero when granted)
    pub retry_after: Duration,
}

impl QuotaDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn denied(retry_after: Duration) -> Self {
        Self {
            granted: false,
            retry_after,
        }
    }
}

/// Trait for a persistent quota store shared between processes
///
/// Implementations:
/// - `ReceiptDb`: per-window usage rows in SQLite
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Atomically consume `requests`/`tokens` from the shared window if they fit
    async fn try_consume(
        &self,
        requests: u32,
        tokens: u32,
        limits: (u32, u32),
        window: Duration,
    ) -> Result<QuotaDecision>;

    /// Give back usage consumed in the current window that will not be spent
    async fn refund(&self, _requests: u32, _tokens: u32, _window: Duration) -> Result<()> {
        Ok(())
    }

    /// Get provider name for logging
    fn name(&self) -> &str;
}
