//! # dog-taskqueue: In-Process Task Queue
//!
//! **Priority lanes, per-owner rate limiting, dependency-aware scheduling and
//! retry/dead-letter handling behind one facade**
//!
//! A submission passes the rate limiter, is registered with the dependency
//! resolver (rejected if it would close a cycle) and lands in its priority
//! lane once every dependency has succeeded. Workers lease jobs with
//! [`TaskQueue::dequeue_for_worker`] and report the outcome; failures are
//! retried with exponential backoff until the budget runs out and the job is
//! dead-lettered.
//!
//! ## Features
//!
//! - **Weighted round-robin**: HIGH/MEDIUM/LOW lanes served 3:2:1 by default, LOW waits at most one round
//! - **Sliding-window rate limiting**: per owner key, atomic check-and-record
//! - **Dependencies**: DAG with atomic cycle rejection; dependents unblock when their last dependency succeeds
//! - **Retries**: exponential backoff with an optional jitter, per-job budgets, permanent failures, dead-letter store
//! - **Leases**: running jobs carry a deadline; the [`LeaseReaper`] fails expired ones on the worker's behalf
//! - **Observability**: `tracing` logs, a broadcast stream of [`JobEvent`]s and live counters
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_taskqueue::prelude::*;
//!
//! let queue: TaskQueue<String> = TaskQueue::new(QueueConfig::default())?;
//!
//! let fetch = queue.submit(SubmitRequest::new("fetch".to_string(), "user_1"))?;
//! let parse = queue.submit(
//!     SubmitRequest::new("parse".to_string(), "user_1")
//!         .with_tier(PriorityTier::High)
//!         .depends_on(fetch.clone()),
//! )?;
//! assert_eq!(queue.status(&parse)?, JobState::Blocked);
//!
//! let job = queue.dequeue_for_worker().expect("fetch is ready");
//! assert_eq!(job.job_id, fetch);
//! queue.report_success(&job.job_id)?;
//!
//! assert_eq!(queue.status(&parse)?, JobState::Ready);
//! # Ok::<(), dog_taskqueue::QueueError>(())
//! ```

pub mod clock;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod fifo;
pub mod observability;
pub mod rate_limit;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PriorityWeights, QueueConfig, RateLimitConfig, RetryConfig};
pub use dependency::{DependencyResolver, NodeStatus};
pub use engine::{BoxStream, QueueStats, TaskQueue};
pub use error::{JobError, QueueError, QueueResult};
pub use fifo::FifoQueue;
pub use rate_limit::{RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};
pub use reaper::{LeaseReaper, ReaperHandle};
pub use retry::{DeadLetterEntry, RetryAction, RetryController, RetryPolicy, RetryRecord};
pub use scheduler::{LaneSizes, PriorityScheduler};
pub use types::*;
pub use worker::{JobHandler, WorkerHandle, WorkerOptions, WorkerPool};

/// Convenient imports for queue users
pub mod prelude {
    pub use crate::{
        JobError, JobEvent, JobHandler, JobId, JobSnapshot, JobState, LeaseReaper, LeaseToken, LeasedJob,
        PriorityTier, QueueConfig, QueueError, QueueResult, RetryAction, SubmitRequest,
        TaskQueue, WorkerPool,
    };
    pub use async_trait::async_trait;
}
