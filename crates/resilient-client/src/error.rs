//! Error types for resilient calls

use common::ContextError;
use transport::{ErrorClassification, TransportError};

/// Why a logical call failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("upstream call aborted: {0}")]
    Context(#[from] ContextError),

    #[error("fatal upstream error: {0}")]
    Fatal(#[source] TransportError),

    #[error("upstream call failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("rate limiter closed")]
    LimiterClosed,

    #[error("credential pool error: {0}")]
    Pool(credential_pool::Error),
}

impl Error {
    /// Classification of the upstream failure behind this error, if any.
    pub fn classification(&self) -> Option<ErrorClassification> {
        self.last_error().map(|e| e.classification)
    }

    /// The last upstream failure, if the call reached the upstream at all.
    pub fn last_error(&self) -> Option<&TransportError> {
        match self {
            Error::Fatal(e) | Error::Exhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }

    /// True when the caller's context ended the call.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Context(_))
    }
}

impl From<credential_pool::Error> for Error {
    fn from(e: credential_pool::Error) -> Self {
        match e {
            credential_pool::Error::Context(reason) => Error::Context(reason),
            credential_pool::Error::LimiterClosed => Error::LimiterClosed,
            other => Error::Pool(other),
        }
    }
}

/// Result alias for resilient calls.
pub type Result<T> = std::result::Result<T, Error>;
