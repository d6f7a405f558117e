//! Credential pool and rate limiter for the upstream data provider
//!
//! The provider enforces quotas per token and occasionally invalidates tokens
//! without notice. This crate holds the two shared throttles every upstream
//! call passes through:
//!
//! 1. `CredentialPool` hands out tokens round-robin and tracks per-token usage
//!    and health. Authentication failures mark a token unhealthy; it is skipped
//!    until a probation period passes, then tried again.
//! 2. `RateLimiter` is a token bucket bounding the call rate of one client
//!    regardless of which credential is used.

pub mod error;
pub mod limiter;
pub mod pool;

pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use pool::{
    Credential, CredentialPool, CredentialStats, DEFAULT_UNHEALTHY_RETRY_AFTER, PoolStats,
    PoolStatus, SelectedCredential,
};
