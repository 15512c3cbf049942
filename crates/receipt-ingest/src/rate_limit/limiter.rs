//! Request/token budget for the extraction API.
//!
//! The limiter tracks a rolling window with a fixed allowance of requests and
//! tokens. Both counters live in one `AtomicU64` (requests in the high half,
//! tokens in the low half) so a grant decrements them together with a single
//! compare-and-swap: concurrent pipelines can never over-draw the window, and
//! a request that does not fit is deferred rather than granted and corrected.
//!
//! Independently of the local budget, a 429 from the remote API bumps an
//! exponential backoff. While the backoff is active every request is denied.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::backend::RateLimiterBackend;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::types::job::deadline_after;
use crate::types::TokenUsage;

fn pack(requests: u32, tokens: u32) -> u64 {
    ((requests as u64) << 32) | tokens as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Answer to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub allowed: bool,
    /// How long to wait before asking again (zero when allowed)
    pub delay: Duration,
}

impl Permission {
    fn granted() -> Self {
        Self {
            allowed: true,
            delay: Duration::ZERO,
        }
    }

    fn denied(delay: Duration) -> Self {
        Self {
            allowed: false,
            delay,
        }
    }
}

/// Snapshot of the current budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBudget {
    pub window_requests_remaining: u32,
    pub window_tokens_remaining: u32,
    pub window_reset_at: DateTime<Utc>,
    pub current_backoff_ms: u64,
}

#[derive(Debug)]
struct BackoffState {
    current: Duration,
    until: Option<Instant>,
}

/// Rolling-window rate limiter with remote backoff
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Packed (requests, tokens) remaining in the window
    budget: AtomicU64,
    window_reset_at: Mutex<Instant>,
    backoff: Mutex<BackoffState>,
    backend: Option<Arc<dyn RateLimiterBackend>>,
    granted_total: AtomicU64,
    denied_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            budget: AtomicU64::new(pack(config.requests_per_window, config.tokens_per_window)),
            window_reset_at: Mutex::new(deadline_after(now, config.window())),
            backoff: Mutex::new(BackoffState {
                current: Duration::ZERO,
                until: None,
            }),
            backend: None,
            granted_total: AtomicU64::new(0),
            denied_total: AtomicU64::new(0),
            config,
        }
    }

    /// Share the budget with other sessions through a persistent backend
    pub fn with_backend(mut self, backend: Arc<dyn RateLimiterBackend>) -> Self {
        tracing::info!("Rate limiter sharing quota through '{}'", backend.name());
        self.backend = Some(backend);
        self
    }

    /// Refill the window if it has expired; returns time left in the window
    fn roll_window(&self, now: Instant) -> Duration {
        let mut reset_at = self.window_reset_at.lock();
        if now >= *reset_at {
            self.budget.store(
                pack(self.config.requests_per_window, self.config.tokens_per_window),
                Ordering::SeqCst,
            );
            *reset_at = deadline_after(now, self.config.window());
            tracing::debug!("Rate limit window replenished");
        }
        *reset_at - now
    }

    fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        let backoff = self.backoff.lock();
        match backoff.until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    fn cap(&self, delay: Duration) -> Duration {
        delay.min(self.config.max_wait())
    }

    /// Ask for permission to make one call costing `estimated_tokens`
    ///
    /// On grant the budget is already decremented.
    pub fn request_permission(&self, estimated_tokens: u32) -> Permission {
        let now = Instant::now();
        let window_left = self.roll_window(now);

        if let Some(remaining) = self.backoff_remaining(now) {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
            return Permission::denied(self.cap(remaining));
        }

        // A single call larger than the whole window is charged the whole window
        let tokens = estimated_tokens.min(self.config.tokens_per_window);
        let mut current = self.budget.load(Ordering::SeqCst);
        loop {
            let (requests, available) = unpack(current);
            if requests == 0 || available < tokens {
                self.denied_total.fetch_add(1, Ordering::Relaxed);
                return Permission::denied(self.cap(window_left));
            }
            let next = pack(requests - 1, available - tokens);
            match self
                .budget
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.granted_total.fetch_add(1, Ordering::Relaxed);
                    return Permission::granted();
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a grant that was not used
    fn refund(&self, requests: u32, tokens: u32) {
        let max_requests = self.config.requests_per_window;
        let max_tokens = self.config.tokens_per_window;
        let _ = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                let (r, t) = unpack(word);
                Some(pack(
                    r.saturating_add(requests).min(max_requests),
                    t.saturating_add(tokens).min(max_tokens),
                ))
            });
    }

    /// Hand back a grant that will not be used, locally and in the shared store
    pub async fn release(&self, estimated_tokens: u32) {
        let tokens = estimated_tokens.min(self.config.tokens_per_window);
        self.refund(1, tokens);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.refund(1, tokens, self.config.window()).await {
                tracing::warn!("Failed to return quota to '{}': {}", backend.name(), e);
            }
        }
    }

    /// Local grant plus the shared backend's agreement, if one is configured
    async fn try_acquire_once(&self, estimated_tokens: u32) -> Result<Permission> {
        let permission = self.request_permission(estimated_tokens);
        if !permission.allowed {
            return Ok(permission);
        }
        let Some(backend) = &self.backend else {
            return Ok(permission);
        };

        let tokens = estimated_tokens.min(self.config.tokens_per_window);
        let limits = (self.config.requests_per_window, self.config.tokens_per_window);
        match backend
            .try_consume(1, tokens, limits, self.config.window())
            .await
        {
            Ok(decision) if decision.granted => Ok(permission),
            Ok(decision) => {
                self.refund(1, tokens);
                tracing::debug!("Shared quota refused call, retry in {:?}", decision.retry_after);
                Ok(Permission::denied(self.cap(decision.retry_after)))
            }
            Err(e) => {
                self.refund(1, tokens);
                Err(e)
            }
        }
    }

    /// Wait for permission: ask, sleep once for the capped delay, ask again
    ///
    /// A second denial is returned as `Error::RateLimited`.
    pub async fn acquire(&self, estimated_tokens: u32) -> Result<()> {
        let first = self.try_acquire_once(estimated_tokens).await?;
        if first.allowed {
            return Ok(());
        }

        tracing::debug!("Rate limit budget exhausted, waiting {:?}", first.delay);
        tokio::time::sleep(first.delay).await;

        let second = self.try_acquire_once(estimated_tokens).await?;
        if second.allowed {
            return Ok(());
        }

        tracing::warn!(
            "Rate limit still exhausted after waiting, next window in {:?}",
            second.delay
        );
        Err(Error::RateLimited {
            retry_after_ms: second.delay.as_millis() as u64,
        })
    }

    /// Record a failed API call; returns true if it raised the backoff
    pub fn record_failure(&self, error: &Error) -> bool {
        if !error.is_rate_limited() {
            return false;
        }

        let initial = Duration::from_millis(self.config.initial_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = self.backoff.lock();
        let next = if backoff.current.is_zero() {
            initial
        } else {
            let grown = backoff.current.as_secs_f64() * self.config.backoff_multiplier;
            Duration::try_from_secs_f64(grown).unwrap_or(max)
        };
        backoff.current = next.min(max);

        // Respect a longer server-supplied retry-after
        let hinted = match error {
            Error::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => Duration::ZERO,
        };
        backoff.until = Some(deadline_after(Instant::now(), backoff.current.max(hinted)));

        tracing::warn!("Remote rate limit hit, backing off {:?}", backoff.current);
        true
    }

    /// Record a successful call and reconcile the estimate with real usage
    pub fn record_success(&self, estimated_tokens: u32, actual: Option<TokenUsage>) {
        {
            let mut backoff = self.backoff.lock();
            backoff.current = Duration::ZERO;
            backoff.until = None;
        }

        let Some(usage) = actual else {
            return;
        };
        let estimated = estimated_tokens.min(self.config.tokens_per_window);
        let actual = usage.total();
        if actual < estimated {
            self.refund(0, estimated - actual);
        } else if actual > estimated {
            let extra = actual - estimated;
            let _ = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                    let (r, t) = unpack(word);
                    Some(pack(r, t.saturating_sub(extra)))
                });
        }
    }

    /// Current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.backoff.lock().current
    }

    /// Snapshot of the budget
    pub fn budget(&self) -> RateLimitBudget {
        let now = Instant::now();
        let window_left = self.roll_window(now);
        let (requests, tokens) = unpack(self.budget.load(Ordering::SeqCst));
        RateLimitBudget {
            window_requests_remaining: requests,
            window_tokens_remaining: tokens,
            window_reset_at: Utc::now()
                + chrono::Duration::from_std(window_left).unwrap_or_else(|_| chrono::Duration::zero()),
            current_backoff_ms: self.current_backoff().as_millis() as u64,
        }
    }

    /// Total grants and denials since creation
    pub fn counters(&self) -> (u64, u64) {
        (
            self.granted_total.load(Ordering::Relaxed),
            self.denied_total.load(Ordering::Relaxed),
        )
    }
}
