use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clock::{to_chrono, Clock, SystemClock},
    config::QueueConfig,
    dependency::DependencyResolver,
    observability::{GlobalMetrics, LiveMetrics},
    rate_limit::{RateLimiter, SlidingWindowLimiter},
    retry::{DeadLetterEntry, RetryAction, RetryController, RetryPolicy},
    scheduler::{LaneSizes, PriorityScheduler},
    JobError, JobEvent, JobId, JobRecord, JobSnapshot, JobState, LeaseToken, LeasedJob,
    QueueError, QueueResult, SubmitRequest,
};

/// Boxed stream type for event streams
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

type JobTable<P> = HashMap<JobId, JobRecord<P>>;

/// Point-in-time view of the whole queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub lanes: LaneSizes,
    pub states: HashMap<JobState, usize>,
    pub pending_retries: usize,
    pub dead_letters: usize,
    pub tracked_owners: usize,
    /// Success markers held for acknowledged jobs
    pub archived_markers: usize,
    pub metrics: GlobalMetrics,
}

impl QueueStats {
    /// Number of known jobs in `state`
    pub fn count(&self, state: JobState) -> usize {
        self.states.get(&state).copied().unwrap_or(0)
    }
}

/// Task queue facade.
///
/// Owns every job from submission until it is acknowledged and drives it
/// through the rate limiter, dependency resolver, priority scheduler and
/// retry controller. Composite operations hold the job table lock for their
/// whole duration and take component locks in the fixed order
/// job table, resolver, retry controller, scheduler lanes. The rate limiter
/// is consulted before the table lock is taken.
pub struct TaskQueue<P = Vec<u8>> {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    jobs: Mutex<JobTable<P>>,
    resolver: DependencyResolver,
    retry: RetryController,
    scheduler: PriorityScheduler,
    rate_limiter: Arc<dyn RateLimiter>,
    metrics: LiveMetrics,
    event_broadcaster: broadcast::Sender<JobEvent>,
}

impl<P: Send + Sync + 'static> TaskQueue<P> {
    /// Create a queue on the wall clock
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a queue driven by the given clock
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        config.validate()?;

        let rate_limiter = Arc::new(SlidingWindowLimiter::from_config(
            &config.rate_limit,
            clock.clone(),
        ));
        let retry =
            RetryController::with_clock(RetryPolicy::from_config(&config.retry), clock.clone());
        let (event_broadcaster, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            scheduler: PriorityScheduler::new(config.priority_weights),
            resolver: DependencyResolver::new(),
            jobs: Mutex::new(HashMap::new()),
            metrics: LiveMetrics::new(),
            retry,
            rate_limiter,
            event_broadcaster,
            clock,
            config,
        })
    }

    /// Replace the default sliding-window limiter
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Admit a job.
    ///
    /// Fails with `RateLimitExceeded` or `CycleDetected`; otherwise the job
    /// is `Ready` (queued in its lane) or `Blocked` on its dependencies.
    #[instrument(skip_all, fields(owner_key = %request.owner_key, tier = %request.tier))]
    pub fn submit(&self, request: SubmitRequest<P>) -> QueueResult<JobId> {
        let now = self.clock.now();

        if !self.rate_limiter.check_and_record(&request.owner_key) {
            self.metrics.record_rate_limited();
            warn!("Rate limit exceeded for owner {}", request.owner_key);
            self.emit(JobEvent::RateLimited {
                owner_key: request.owner_key.clone(),
                at: now,
            });
            return Err(QueueError::RateLimitExceeded {
                owner_key: request.owner_key,
            });
        }

        let SubmitRequest {
            payload,
            owner_key,
            tier,
            depends_on,
            job_id,
            max_retries,
        } = request;
        let job_id = job_id.unwrap_or_default();

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job_id) {
            return Err(QueueError::DuplicateJob(job_id));
        }

        if let Err(err) = self.resolver.add_job(&job_id, depends_on.iter().cloned()) {
            if matches!(err, QueueError::CycleDetected { .. }) {
                self.metrics.record_cycle_rejected();
            }
            warn!("Rejected job {}: {}", job_id, err);
            return Err(err);
        }

        let mut record = JobRecord::new(
            job_id.clone(),
            owner_key.clone(),
            tier,
            Arc::new(payload),
            depends_on,
            max_retries,
            now,
        );
        self.metrics.record_submitted(tier);
        self.emit(JobEvent::Submitted {
            job_id: job_id.clone(),
            owner_key,
            tier,
            at: now,
        });

        if self.resolver.is_ready(&job_id) {
            self.make_ready(&mut record, now);
        } else {
            record.transition(JobState::Blocked, now);
            let waiting_on = self.resolver.unsatisfied_dependencies(&job_id);
            debug!("Job {} blocked on {:?}", job_id, waiting_on);
            self.emit(JobEvent::Blocked {
                job_id: job_id.clone(),
                waiting_on,
                at: now,
            });
        }

        info!("Submitted job {} ({})", job_id, record.state);
        jobs.insert(job_id.clone(), record);
        Ok(job_id)
    }

    /// Hand the next runnable job to a worker, or `None` if there is no work.
    ///
    /// Due retries are promoted into their lanes first. At most one pass is
    /// made over the jobs queued at the time of the call.
    pub fn dequeue_for_worker(&self) -> Option<LeasedJob<P>> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        self.promote_due_retries(&mut jobs, now);

        for _ in 0..self.scheduler.len() {
            let (tier, job_id) = self.scheduler.next_entry()?;
            let Some(record) = jobs.get_mut(&job_id) else {
                panic!("lane holds unknown job {}", job_id);
            };
            assert_eq!(
                record.state,
                JobState::Ready,
                "lane holds job {} in state {}",
                job_id,
                record.state
            );

            if !self.resolver.is_ready(&job_id) {
                warn!("Job {} was queued with unmet dependencies", job_id);
                record.transition(JobState::Blocked, now);
                continue;
            }
            if !record.is_eligible(now) {
                self.scheduler.submit(job_id, tier);
                continue;
            }

            let lease_until = now + to_chrono(self.config.lease_timeout());
            let lease_token = record.start_running(lease_until, now);
            self.metrics.record_leased(tier);
            self.emit(JobEvent::Leased {
                job_id: job_id.clone(),
                attempt: record.attempts,
                lease_until,
                at: now,
            });
            debug!("Leased job {} (attempt {})", job_id, record.attempts);

            return Some(LeasedJob {
                job_id,
                payload: Arc::clone(&record.payload),
                tier,
                owner_key: record.owner_key.clone(),
                attempt: record.attempts,
                lease_token,
                lease_until,
            });
        }

        None
    }

    /// Mark a running job succeeded and queue the dependents it unblocks.
    ///
    /// Accepts the report from whoever holds the job; workers should use
    /// [`TaskQueue::report_success_with_lease`].
    pub fn report_success(&self, job_id: &JobId) -> QueueResult<()> {
        self.succeed(job_id, None)
    }

    /// Like [`TaskQueue::report_success`], but rejects a report whose lease
    /// was reaped or replaced with `InvalidLeaseToken`
    pub fn report_success_with_lease(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        self.succeed(job_id, Some(lease_token))
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    fn succeed(&self, job_id: &JobId, lease_token: Option<&LeaseToken>) -> QueueResult<()> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();

        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        check_lease(record, lease_token, "complete")?;

        record.transition(JobState::Succeeded, now);
        record.release_lease();
        let tier = record.tier;
        let run_time = record.started_at.map(|started| now - started);

        let unblocked = self.resolver.mark_complete(job_id);
        self.retry.on_success(job_id);
        self.metrics.record_succeeded(tier, run_time);
        self.emit(JobEvent::Succeeded {
            job_id: job_id.clone(),
            at: now,
        });
        info!("Job {} succeeded, unblocked {}", job_id, unblocked.len());

        for dependent in unblocked {
            if let Some(record) = jobs.get_mut(&dependent) {
                if record.state == JobState::Blocked {
                    self.make_ready(record, now);
                }
            }
        }

        Ok(())
    }

    /// Report a failure without detail; the retry budget decides the outcome
    pub fn report_failure(&self, job_id: &JobId) -> QueueResult<RetryAction> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        self.fail_locked(&mut jobs, job_id, None, None, now)
    }

    /// Report a failure with the worker's error.
    ///
    /// Permanent errors dead-letter immediately without consuming retries.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub fn report_failure_with(&self, job_id: &JobId, error: JobError) -> QueueResult<RetryAction> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        self.fail_locked(&mut jobs, job_id, None, Some(&error), now)
    }

    /// Report a failure for the run identified by `lease_token`.
    ///
    /// A worker whose lease was reaped gets `InvalidLeaseToken` and must drop
    /// its result; the retry it was reaped into is left untouched.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub fn report_failure_with_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: JobError,
    ) -> QueueResult<RetryAction> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        self.fail_locked(&mut jobs, job_id, Some(lease_token), Some(&error), now)
    }

    pub fn report_permanent_failure(
        &self,
        job_id: &JobId,
        reason: impl Into<String>,
    ) -> QueueResult<RetryAction> {
        self.report_failure_with(job_id, JobError::Permanent(reason.into()))
    }

    fn fail_locked(
        &self,
        jobs: &mut JobTable<P>,
        job_id: &JobId,
        lease_token: Option<&LeaseToken>,
        error: Option<&JobError>,
        now: DateTime<Utc>,
    ) -> QueueResult<RetryAction> {
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        check_lease(record, lease_token, "fail")?;

        let message = error.map(JobError::message);
        record.release_lease();
        if let Some(message) = message {
            record.last_error = Some(message.to_string());
        }

        let action = match error {
            Some(JobError::Permanent(reason)) => self.retry.dead_letter(job_id, Some(reason.as_str())),
            _ => self.retry.record_failure(job_id, message, record.max_retries),
        };
        let error_text = message.unwrap_or("unspecified failure").to_string();

        match &action {
            RetryAction::Retry {
                retry, eligible_at, ..
            } => {
                record.transition(JobState::RetryScheduled, now);
                record.next_eligible_at = Some(*eligible_at);
                self.metrics.record_retried();
                warn!(
                    "Job {} failed, retry {} at {}: {}",
                    job_id, retry, eligible_at, error_text
                );
                self.emit(JobEvent::RetryScheduled {
                    job_id: job_id.clone(),
                    retry_at: *eligible_at,
                    error: error_text,
                    at: now,
                });
            }
            RetryAction::DeadLetter { failures } => {
                record.transition(JobState::DeadLettered, now);
                self.resolver.mark_failed(job_id);
                self.metrics.record_dead_lettered();
                error!(
                    "Job {} dead-lettered after {} failures: {}",
                    job_id, failures, error_text
                );
                self.emit(JobEvent::DeadLettered {
                    job_id: job_id.clone(),
                    error: error_text,
                    at: now,
                });
            }
        }

        Ok(action)
    }

    /// Cancel a job that is not running or finished.
    ///
    /// Returns the dependents that can now never become ready; they stay
    /// `Blocked` until the caller cancels them too.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub fn cancel(&self, job_id: &JobId) -> QueueResult<Vec<JobId>> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();

        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        if !record.state.is_cancelable() {
            return Err(QueueError::invalid_state(job_id, record.state, "cancel"));
        }

        let orphaned = self.resolver.remove(job_id);
        self.retry.remove(job_id);
        if record.state == JobState::Ready {
            self.scheduler.remove(job_id);
        }

        record.transition(JobState::Canceled, now);
        record.next_eligible_at = None;
        self.metrics.record_canceled();
        self.emit(JobEvent::Canceled {
            job_id: job_id.clone(),
            orphaned: orphaned.clone(),
            at: now,
        });

        if orphaned.is_empty() {
            info!("Canceled job {}", job_id);
        } else {
            warn!("Canceled job {}, orphaned {:?}", job_id, orphaned);
        }
        Ok(orphaned)
    }

    /// Push back the deadline of a running job; returns the new deadline
    pub fn heartbeat(&self, job_id: &JobId, extra: Duration) -> QueueResult<DateTime<Utc>> {
        self.extend(job_id, None, extra)
    }

    /// Heartbeat that only extends the run holding `lease_token`
    pub fn heartbeat_with_lease(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        extra: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        self.extend(job_id, Some(lease_token), extra)
    }

    fn extend(
        &self,
        job_id: &JobId,
        lease_token: Option<&LeaseToken>,
        extra: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();

        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        check_lease(record, lease_token, "heartbeat")?;

        let lease_until = record.lease_until.unwrap_or(now) + to_chrono(extra);
        record.lease_until = Some(lease_until);
        record.updated_at = now;
        Ok(lease_until)
    }

    /// Fail every running job whose deadline has passed, on the worker's behalf
    pub fn reap_expired(&self) -> Vec<JobId> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();

        let mut expired: Vec<JobId> = jobs
            .values()
            .filter(|record| record.lease_expired(now))
            .map(|record| record.job_id.clone())
            .collect();
        expired.sort();

        let lease_error = JobError::retryable("lease expired");
        for job_id in &expired {
            match self.fail_locked(&mut jobs, job_id, None, Some(&lease_error), now) {
                Ok(_) => self.metrics.record_reaped(),
                Err(err) => error!("Failed to reap job {}: {}", job_id, err),
            }
        }

        if !expired.is_empty() {
            warn!("Reaped {} expired leases", expired.len());
        }
        expired
    }

    /// Archive a finished job; its payload and record are dropped
    pub fn acknowledge(&self, job_id: &JobId) -> QueueResult<JobSnapshot> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();

        let state = jobs
            .get(job_id)
            .map(|record| record.state)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        if !state.is_terminal() {
            return Err(QueueError::invalid_state(job_id, state, "acknowledge"));
        }

        let record = jobs
            .remove(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        self.resolver.forget(job_id, now);
        self.retry.acknowledge(job_id);
        debug!("Acknowledged job {}", job_id);
        Ok(record.snapshot())
    }

    pub fn status(&self, job_id: &JobId) -> QueueResult<JobState> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|record| record.state)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    /// Full record of a job, without its payload
    pub fn record(&self, job_id: &JobId) -> QueueResult<JobSnapshot> {
        self.jobs
            .lock()
            .get(job_id)
            .map(JobRecord::snapshot)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    /// Dead-lettered job ids, oldest first
    pub fn dead_letter_list(&self) -> Vec<JobId> {
        self.retry.dead_letter_list()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.retry.dead_letters()
    }

    /// Pending jobs in an order that satisfies every dependency
    pub fn execution_order(&self) -> Vec<JobId> {
        self.resolver.topological_order()
    }

    /// Drop success markers of jobs acknowledged more than `retention` ago
    /// that no pending job still depends on
    pub fn purge_archived(&self, retention: Duration) -> usize {
        let before = self.clock.now() - to_chrono(retention);
        self.resolver.purge_archived(before)
    }

    /// Drop rate-limit history for owners with no recent submissions
    pub fn prune_rate_limits(&self) -> usize {
        self.rate_limiter.prune_idle()
    }

    /// Submissions `owner_key` may still make in the current window
    pub fn remaining_quota(&self, owner_key: &str) -> u32 {
        self.rate_limiter.remaining(owner_key)
    }

    /// Earliest instant a scheduled retry becomes runnable
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry.next_due_at()
    }

    pub fn stats(&self) -> QueueStats {
        let jobs = self.jobs.lock();
        let mut states = HashMap::new();
        for record in jobs.values() {
            *states.entry(record.state).or_insert(0) += 1;
        }

        QueueStats {
            lanes: self.scheduler.size_by_tier(),
            states,
            pending_retries: self.retry.pending_retries(),
            dead_letters: self.retry.dead_letters().len(),
            tracked_owners: self.rate_limiter.tracked_keys(),
            archived_markers: self.resolver.archived_len(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of jobs known to the queue, archived ones excluded
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Lifecycle events as a stream; lagged events are skipped
    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let receiver = self.event_broadcaster.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }

    fn promote_due_retries(&self, jobs: &mut JobTable<P>, now: DateTime<Utc>) {
        for job_id in self.retry.take_due(now) {
            if let Some(record) = jobs.get_mut(&job_id) {
                if record.state == JobState::RetryScheduled {
                    record.next_eligible_at = None;
                    self.make_ready(record, now);
                }
            }
        }
    }

    fn make_ready(&self, record: &mut JobRecord<P>, now: DateTime<Utc>) {
        record.transition(JobState::Ready, now);
        self.scheduler.submit(record.job_id.clone(), record.tier);
        self.emit(JobEvent::Ready {
            job_id: record.job_id.clone(),
            tier: record.tier,
            at: now,
        });
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }
}

/// Reports must target a running job; with a token, only the current run's
fn check_lease<P>(
    record: &JobRecord<P>,
    lease_token: Option<&LeaseToken>,
    operation: &'static str,
) -> QueueResult<()> {
    if let Some(token) = lease_token {
        if !record.holds_lease(token) {
            warn!(
                "Rejected {} for job {}: lease {} is not current",
                operation, record.job_id, token
            );
            return Err(QueueError::InvalidLeaseToken(record.job_id.clone()));
        }
    }
    if record.state != JobState::Running {
        return Err(QueueError::invalid_state(&record.job_id, record.state, operation));
    }
    Ok(())
}

impl<P> std::fmt::Debug for TaskQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("scheduler", &self.scheduler)
            .field("retry", &self.retry)
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}
