//! Client-side rate limiting for the extraction API

pub mod backend;
pub mod limiter;

pub use backend::{QuotaDecision, RateLimiterBackend};
pub use limiter::{Permission, RateLimitBudget, RateLimiter};
