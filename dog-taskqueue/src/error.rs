use thiserror::Error;

use crate::types::{JobId, JobState};

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced synchronously to submitters and workers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Submission rejected by the sliding window; the caller may retry later
    #[error("Rate limit exceeded for owner: {owner_key}")]
    RateLimitExceeded { owner_key: String },

    /// Submission permanently rejected; the dependency set can never be satisfied
    #[error("Dependency cycle detected for job {job_id}: {}", format_path(.path))]
    CycleDetected { job_id: JobId, path: Vec<JobId> },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job already registered: {0}")]
    DuplicateJob(JobId),

    #[error("Cannot {operation} job {job_id} in state {state}")]
    InvalidState {
        job_id: JobId,
        state: JobState,
        operation: &'static str,
    },

    /// Report from a worker whose lease was reaped or replaced
    #[error("Invalid lease token for job {0}")]
    InvalidLeaseToken(JobId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub(crate) fn invalid_state(job_id: &JobId, state: JobState, operation: &'static str) -> Self {
        Self::InvalidState {
            job_id: job_id.clone(),
            state,
            operation,
        }
    }

    /// Whether the caller can reasonably resubmit the same request later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}

fn format_path(path: &[JobId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Job execution outcome reported by a worker - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-letter immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
