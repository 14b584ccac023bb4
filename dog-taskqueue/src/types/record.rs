use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, LeaseToken, PriorityTier};

/// Job lifecycle state
///
/// ```text
/// Pending -> Blocked | Ready
/// Blocked -> Ready
/// Ready -> Running | Blocked
/// Running -> Succeeded | RetryScheduled | DeadLettered
/// RetryScheduled -> Ready
/// Pending | Blocked | Ready | RetryScheduled -> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, admission checks in progress
    Pending,

    /// Waiting on at least one dependency
    Blocked,

    /// Sitting in a priority lane
    Ready,

    /// Handed to a worker
    Running,

    /// Failed and waiting out its backoff delay
    RetryScheduled,

    /// Completed successfully
    Succeeded,

    /// Retry budget exhausted or permanent failure
    DeadLettered,

    /// Removed by the caller before it ran
    Canceled,
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Canceled)
    }

    /// Check if the job may still be canceled
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Blocked | Self::Ready | Self::RetryScheduled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Blocked)
                | (Pending, Ready)
                | (Blocked, Ready)
                | (Ready, Running)
                | (Ready, Blocked)
                | (Running, Succeeded)
                | (Running, RetryScheduled)
                | (Running, DeadLettered)
                | (RetryScheduled, Ready)
                | (Pending, Canceled)
                | (Blocked, Canceled)
                | (Ready, Canceled)
                | (RetryScheduled, Canceled)
        )
    }

    /// Get the state name as a string
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Job record - runtime state owned by the engine
#[derive(Debug)]
pub struct JobRecord<P> {
    pub job_id: JobId,
    pub owner_key: String,
    pub tier: PriorityTier,
    pub payload: Arc<P>,
    pub depends_on: Vec<JobId>,
    pub state: JobState,

    /// Number of times the job has been handed to a worker
    pub attempts: u32,

    /// Per-job retry budget override
    pub max_retries: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Start of the current or most recent run
    pub started_at: Option<DateTime<Utc>>,

    /// Deadline for the current run (if running)
    pub lease_until: Option<DateTime<Utc>>,

    /// Token of the worker holding the current run
    pub lease_token: Option<LeaseToken>,

    /// Earliest time a scheduled retry may run
    pub next_eligible_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

impl<P> JobRecord<P> {
    /// Create a new record in `Pending`
    pub fn new(
        job_id: JobId,
        owner_key: String,
        tier: PriorityTier,
        payload: Arc<P>,
        depends_on: Vec<JobId>,
        max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            owner_key,
            tier,
            payload,
            depends_on,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            lease_until: None,
            lease_token: None,
            next_eligible_at: None,
            last_error: None,
        }
    }

    /// Move along the state machine.
    ///
    /// # Panics
    ///
    /// Panics on an edge the state machine does not contain. Continuing after
    /// an illegal transition risks losing the job.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) {
        assert!(
            self.state.can_transition_to(next),
            "illegal transition for job {}: {} -> {}",
            self.job_id,
            self.state,
            next
        );
        self.state = next;
        self.updated_at = now;
    }

    /// Start a run with the given deadline; returns the run's lease token
    pub fn start_running(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) -> LeaseToken {
        self.transition(JobState::Running, now);
        self.attempts += 1;
        self.started_at = Some(now);
        self.lease_until = Some(lease_until);
        self.next_eligible_at = None;

        let token = LeaseToken::new();
        self.lease_token = Some(token.clone());
        token
    }

    /// Whether `token` belongs to the current run
    pub fn holds_lease(&self, token: &LeaseToken) -> bool {
        self.state == JobState::Running && self.lease_token.as_ref() == Some(token)
    }

    /// End the current run's lease
    pub fn release_lease(&mut self) {
        self.lease_until = None;
        self.lease_token = None;
    }

    /// Check if the run deadline has passed
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.lease_until) {
            (JobState::Running, Some(lease_until)) => lease_until < now,
            _ => false,
        }
    }

    /// Whether a scheduled retry may run at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.map_or(true, |at| at <= now)
    }

    /// Payload-free copy for inspection
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            owner_key: self.owner_key.clone(),
            tier: self.tier,
            depends_on: self.depends_on.clone(),
            state: self.state,
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            lease_until: self.lease_until,
            next_eligible_at: self.next_eligible_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a job record without its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub owner_key: String,
    pub tier: PriorityTier,
    pub depends_on: Vec<JobId>,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A job that has been handed to a worker
#[derive(Debug)]
pub struct LeasedJob<P> {
    pub job_id: JobId,
    pub payload: Arc<P>,
    pub tier: PriorityTier,
    pub owner_key: String,

    /// 1 on the first run, incremented on every retry
    pub attempt: u32,

    /// Proof of this lease, required by the lease-checked reports
    pub lease_token: LeaseToken,

    /// The job is reported failed on the worker's behalf after this
    pub lease_until: DateTime<Utc>,
}

impl<P> Clone for LeasedJob<P> {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            payload: Arc::clone(&self.payload),
            tier: self.tier,
            owner_key: self.owner_key.clone(),
            attempt: self.attempt,
            lease_token: self.lease_token.clone(),
            lease_until: self.lease_until,
        }
    }
}

impl<P> LeasedJob<P> {
    /// Get the job ID
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Get the payload
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Check if the lease is still valid
    pub fn lease_valid(&self, now: DateTime<Utc>) -> bool {
        self.lease_until > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord<Vec<u8>> {
        JobRecord::new(
            JobId::from("job"),
            "owner".to_string(),
            PriorityTier::Medium,
            Arc::new(b"payload".to_vec()),
            Vec::new(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            JobState::Pending,
            JobState::Blocked,
            JobState::Ready,
            JobState::Running,
            JobState::RetryScheduled,
            JobState::Succeeded,
            JobState::DeadLettered,
            JobState::Canceled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_running_is_not_cancelable() {
        assert!(!JobState::Running.is_cancelable());
        assert!(JobState::RetryScheduled.is_cancelable());
    }

    #[test]
    fn test_start_running_counts_attempts() {
        let mut record = record();
        let now = Utc::now();
        record.transition(JobState::Ready, now);
        let token = record.start_running(now + chrono::Duration::seconds(5), now);

        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.attempts, 1);
        assert!(record.holds_lease(&token));
        assert!(!record.holds_lease(&LeaseToken::new()));
        assert!(!record.lease_expired(now));
        assert!(record.lease_expired(now + chrono::Duration::seconds(6)));
    }

    #[test]
    fn test_released_lease_is_not_held() {
        let mut record = record();
        let now = Utc::now();
        record.transition(JobState::Ready, now);
        let token = record.start_running(now + chrono::Duration::seconds(5), now);

        record.release_lease();
        assert!(!record.holds_lease(&token));
        assert_eq!(record.lease_until, None);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_panics() {
        let mut record = record();
        record.transition(JobState::Succeeded, Utc::now());
    }
}
