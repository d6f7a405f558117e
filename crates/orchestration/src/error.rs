//! Error types for jobs and collectors

use common::ContextError;
use transport::ErrorClassification;

/// Why a collector could not finish a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Upstream(#[from] resilient_client::Error),

    #[error("collection aborted: {0}")]
    Context(#[from] ContextError),

    #[error("invalid collection scope: {0}")]
    InvalidScope(String),

    #[error("malformed upstream payload: {0}")]
    Payload(String),

    #[error("repository error: {0}")]
    Repository(String),
}

impl CollectError {
    /// Upstream classification behind this error, if any.
    pub fn classification(&self) -> Option<ErrorClassification> {
        match self {
            CollectError::Upstream(e) => e.classification(),
            _ => None,
        }
    }
}

/// Errors from the job scheduler and from job handlers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job {0} panicked")]
    Panicked(String),

    #[error("job failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Collect(#[from] CollectError),
}

impl From<ContextError> for JobError {
    fn from(e: ContextError) -> Self {
        JobError::Collect(CollectError::Context(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::TransportError;

    #[test]
    fn classification_flows_through_upstream_errors() {
        let err = CollectError::from(resilient_client::Error::Fatal(TransportError::fatal(
            "bad params",
        )));
        assert_eq!(err.classification(), Some(ErrorClassification::Fatal));
        assert_eq!(CollectError::Payload("x".into()).classification(), None);
    }

    #[test]
    fn context_errors_become_collect_errors() {
        let err = JobError::from(ContextError::Canceled);
        assert!(matches!(
            err,
            JobError::Collect(CollectError::Context(ContextError::Canceled))
        ));
        assert_eq!(err.to_string(), "collection aborted: context canceled");
    }
}
