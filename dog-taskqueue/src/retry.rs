//! Failure bookkeeping: exponential backoff, delayed re-admission and the
//! dead-letter store.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{to_chrono, Clock, SystemClock},
    config::RetryConfig,
    fifo::FifoQueue,
    JobId,
};

/// Backoff schedule: retry `k` waits `base * 2^(k-1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed before dead-lettering
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay actually applied, jittered when enabled
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        delay.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// What to do with a job after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-admit once `eligible_at` has passed
    Retry {
        /// 1-based retry number
        retry: u32,
        delay: Duration,
        eligible_at: DateTime<Utc>,
    },
    /// Budget exhausted or failure was permanent
    DeadLetter { failures: u32 },
}

impl RetryAction {
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

/// Failure history for one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub failures: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

/// A job that exhausted its retries or failed permanently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub failures: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

type DueEntry = Reverse<(DateTime<Utc>, u64, JobId)>;

#[derive(Debug, Default)]
struct RetryState {
    records: HashMap<JobId, RetryRecord>,
    /// Min-heap on (eligible_at, sequence)
    delayed: BinaryHeap<DueEntry>,
    sequence: u64,
}

/// Tracks failures per job and decides between retry and dead-letter
pub struct RetryController {
    policy: RetryPolicy,
    state: Mutex<RetryState>,
    dead_letters: FifoQueue<DeadLetterEntry>,
    clock: Arc<dyn Clock>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            state: Mutex::new(RetryState::default()),
            dead_letters: FifoQueue::new(),
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure with the default budget and no error detail
    pub fn on_failure(&self, job_id: &JobId) -> RetryAction {
        self.record_failure(job_id, None, None)
    }

    /// Record a failure. `max_retries` overrides the policy budget for this job.
    pub fn record_failure(
        &self,
        job_id: &JobId,
        error: Option<&str>,
        max_retries: Option<u32>,
    ) -> RetryAction {
        let now = self.clock.now();
        let budget = max_retries.unwrap_or(self.policy.max_retries);

        let mut state = self.state.lock();
        let record = state.records.entry(job_id.clone()).or_default();
        record.failures += 1;
        if let Some(error) = error {
            record.errors.push(error.to_string());
        }

        if record.failures > budget {
            let failures = record.failures;
            let last_error = record.errors.last().cloned();
            state.records.remove(job_id);
            drop(state);

            self.push_dead_letter(job_id, failures, last_error, now);
            return RetryAction::DeadLetter { failures };
        }

        let retry = record.failures;
        let delay = self.policy.backoff(retry);
        let eligible_at = now + to_chrono(delay);
        record.next_eligible_at = Some(eligible_at);

        state.sequence += 1;
        let sequence = state.sequence;
        state
            .delayed
            .push(Reverse((eligible_at, sequence, job_id.clone())));

        RetryAction::Retry {
            retry,
            delay,
            eligible_at,
        }
    }

    /// Dead-letter immediately, regardless of remaining budget
    pub fn dead_letter(&self, job_id: &JobId, error: Option<&str>) -> RetryAction {
        let now = self.clock.now();
        let record = self.state.lock().records.remove(job_id).unwrap_or_default();

        let failures = record.failures + 1;
        let last_error = error
            .map(str::to_string)
            .or_else(|| record.errors.last().cloned());
        self.push_dead_letter(job_id, failures, last_error, now);
        RetryAction::DeadLetter { failures }
    }

    fn push_dead_letter(
        &self,
        job_id: &JobId,
        failures: u32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.dead_letters.enqueue(DeadLetterEntry {
            job_id: job_id.clone(),
            failures,
            last_error,
            dead_lettered_at: now,
        });
    }

    /// Clear history after a success
    pub fn on_success(&self, job_id: &JobId) {
        self.state.lock().records.remove(job_id);
    }

    /// Forget a job; any pending retry is dropped
    pub fn remove(&self, job_id: &JobId) -> bool {
        self.state.lock().records.remove(job_id).is_some()
    }

    /// Pop every retry whose eligibility time is at or before `now`, oldest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut state = self.state.lock();
        let mut due = Vec::new();

        while let Some(Reverse((at, _, _))) = state.delayed.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, job_id))) = state.delayed.pop() else {
                break;
            };
            // Stale entries belong to jobs that were canceled or rescheduled
            let live = state
                .records
                .get(&job_id)
                .is_some_and(|record| record.next_eligible_at == Some(at));
            if live {
                if let Some(record) = state.records.get_mut(&job_id) {
                    record.next_eligible_at = None;
                }
                due.push(job_id);
            }
        }

        due
    }

    /// Earliest pending retry, if any
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        state
            .delayed
            .iter()
            .filter(|Reverse((at, _, job_id))| {
                state
                    .records
                    .get(job_id)
                    .is_some_and(|record| record.next_eligible_at == Some(*at))
            })
            .map(|Reverse((at, _, _))| *at)
            .min()
    }

    /// Jobs currently waiting out a backoff delay
    pub fn pending_retries(&self) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|record| record.next_eligible_at.is_some())
            .count()
    }

    pub fn retry_record(&self, job_id: &JobId) -> Option<RetryRecord> {
        self.state.lock().records.get(job_id).cloned()
    }

    /// Failures recorded so far for a job still in play
    pub fn failures(&self, job_id: &JobId) -> u32 {
        self.state
            .lock()
            .records
            .get(job_id)
            .map_or(0, |record| record.failures)
    }

    /// Dead-lettered job ids, oldest first
    pub fn dead_letter_list(&self) -> Vec<JobId> {
        self.dead_letters
            .snapshot()
            .into_iter()
            .map(|entry| entry.job_id)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.snapshot()
    }

    /// Drop a dead-letter entry once an operator has dealt with it
    pub fn acknowledge(&self, job_id: &JobId) -> bool {
        self.dead_letters.retain(|entry| &entry.job_id != job_id) > 0
    }
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .field("pending_retries", &self.pending_retries())
            .field("dead_letters", &self.dead_letters.size())
            .finish()
    }
}
