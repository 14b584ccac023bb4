use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, PriorityTier};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job passed admission
    Submitted {
        job_id: JobId,
        owner_key: String,
        tier: PriorityTier,
        at: DateTime<Utc>,
    },

    /// Submission rejected by the rate limiter
    RateLimited {
        owner_key: String,
        at: DateTime<Utc>,
    },

    /// Job is waiting on dependencies
    Blocked {
        job_id: JobId,
        waiting_on: Vec<JobId>,
        at: DateTime<Utc>,
    },

    /// Job entered a priority lane
    Ready {
        job_id: JobId,
        tier: PriorityTier,
        at: DateTime<Utc>,
    },

    /// Job was handed to a worker
    Leased {
        job_id: JobId,
        attempt: u32,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Succeeded {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job failed and will be retried
    RetryScheduled {
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job exhausted its retries or failed permanently
    DeadLettered {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job was canceled; `orphaned` dependents can never become ready
    Canceled {
        job_id: JobId,
        orphaned: Vec<JobId>,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::RateLimited { .. } => "rate_limited",
            Self::Blocked { .. } => "blocked",
            Self::Ready { .. } => "ready",
            Self::Leased { .. } => "leased",
            Self::Succeeded { .. } => "succeeded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Canceled { .. } => "canceled",
        }
    }

    /// Get the job ID, if the event concerns an admitted job
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Submitted { job_id, .. }
            | Self::Blocked { job_id, .. }
            | Self::Ready { job_id, .. }
            | Self::Leased { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Canceled { job_id, .. } => Some(job_id),
            Self::RateLimited { .. } => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Submitted { at, .. }
            | Self::RateLimited { at, .. }
            | Self::Blocked { at, .. }
            | Self::Ready { at, .. }
            | Self::Leased { at, .. }
            | Self::Succeeded { at, .. }
            | Self::RetryScheduled { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Canceled { at, .. } => at,
        }
    }
}
