use thiserror::Error;

/// Errors returned synchronously by the scheduler API.
///
/// Failures that happen after a job was accepted (resolution, rebuild,
/// constraint timeout) are never raised here; they end up in the job's
/// [`Outcome`](crate::job::Outcome).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule request was malformed (e.g. negative layer id).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No job with the given ID is tracked (unknown or already terminal).
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The scheduler was created outside a Tokio runtime.
    #[error("No Tokio runtime available")]
    NoRuntime,

    /// `shutdown` was called; new jobs are no longer accepted.
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<layercache_core::LayercacheError> for SchedulerError {
    fn from(e: layercache_core::LayercacheError) -> Self {
        match e {
            layercache_core::LayercacheError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
