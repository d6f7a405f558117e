//! Error types for pool and limiter operations

use common::ContextError;

/// Errors from pool and limiter operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential pool must hold at least one credential")]
    Empty,

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("refusing to remove {0}: a pool must keep at least one credential")]
    LastCredential(String),

    #[error("invalid rate limiter: {0}")]
    InvalidLimiter(String),

    #[error("rate limiter closed")]
    LimiterClosed,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Result alias for pool and limiter operations.
pub type Result<T> = std::result::Result<T, Error>;
