use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use dog_taskqueue::prelude::*;
use dog_taskqueue::{JobId, RetryConfig, WorkerOptions};

/// Fast retries so tests run on the wall clock
fn fast_config() -> QueueConfig {
    QueueConfig {
        retry: RetryConfig {
            base_delay_seconds: 0.01,
            max_delay_seconds: 0.05,
            ..RetryConfig::default()
        },
        lease_timeout_seconds: 0.05,
        ..QueueConfig::default()
    }
}

async fn wait_until<F>(mut done: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for queue to drain");
}

/// Records the order payloads were handled in
#[derive(Default)]
struct RecordingHandler {
    handled: Mutex<Vec<String>>,
}

#[async_trait]
impl JobHandler<String> for RecordingHandler {
    async fn handle(&self, job: LeasedJob<String>) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.handled.lock().push(job.payload().clone());
        Ok(())
    }
}

/// Fails a job until it has been attempted `succeed_on` times
struct FlakyHandler {
    succeed_on: u32,
    attempts: Mutex<HashMap<JobId, u32>>,
}

#[async_trait]
impl JobHandler<String> for FlakyHandler {
    async fn handle(&self, job: LeasedJob<String>) -> Result<(), JobError> {
        *self.attempts.lock().entry(job.job_id.clone()).or_default() += 1;
        if job.payload() == "poison" {
            return Err(JobError::permanent("cannot parse payload"));
        }
        if job.attempt < self.succeed_on {
            return Err(JobError::retryable(format!("attempt {} timed out", job.attempt)));
        }
        Ok(())
    }
}

fn submit(queue: &TaskQueue<String>, name: &str, deps: &[&str]) -> JobId {
    queue
        .submit(
            SubmitRequest::new(name.to_string(), "worker-tests")
                .with_job_id(name)
                .with_dependencies(deps.iter().map(|d| JobId::from(*d))),
        )
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_pool_respects_dependencies() {
    let queue = Arc::new(TaskQueue::new(fast_config()).unwrap());
    let handler = Arc::new(RecordingHandler::default());

    submit(&queue, "download", &[]);
    submit(&queue, "process", &["download"]);
    submit(&queue, "report", &["process"]);
    for i in 0..5 {
        submit(&queue, &format!("independent-{}", i), &[]);
    }

    let pool = WorkerPool::start(queue.clone(), handler.clone(), 3);
    assert_eq!(pool.len(), 3);
    wait_until(|| queue.stats().count(JobState::Succeeded) == 8).await;
    pool.shutdown().await.unwrap();

    let handled = handler.handled.lock().clone();
    let position = |name: &str| handled.iter().position(|h| h == name).unwrap();
    assert_eq!(handled.len(), 8);
    assert!(position("download") < position("process"));
    assert!(position("process") < position("report"));
}

#[test_log::test(tokio::test)]
async fn test_pool_retries_then_succeeds() {
    let queue = Arc::new(TaskQueue::new(fast_config()).unwrap());
    let handler = Arc::new(FlakyHandler {
        succeed_on: 3,
        attempts: Mutex::new(HashMap::new()),
    });

    let job_id = submit(&queue, "flaky", &[]);
    let pool = WorkerPool::start_with(
        queue.clone(),
        handler.clone(),
        WorkerOptions {
            concurrency: 2,
            idle_backoff: Duration::from_millis(5),
        },
    );
    wait_until(|| queue.status(&job_id) == Ok(JobState::Succeeded)).await;
    pool.shutdown().await.unwrap();

    assert_eq!(handler.attempts.lock()[&job_id], 3);
    let record = queue.record(&job_id).unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.last_error.as_deref(), Some("attempt 2 timed out"));
    assert_eq!(queue.stats().metrics.jobs_retried, 2);
}

#[test_log::test(tokio::test)]
async fn test_pool_dead_letters_permanent_failures() {
    let queue = Arc::new(TaskQueue::new(fast_config()).unwrap());
    let handler = Arc::new(FlakyHandler {
        succeed_on: 1,
        attempts: Mutex::new(HashMap::new()),
    });

    let poison = submit(&queue, "poison", &[]);
    let dependent = submit(&queue, "after-poison", &["poison"]);
    let pool = WorkerPool::start(queue.clone(), handler.clone(), 1);
    wait_until(|| queue.status(&poison) == Ok(JobState::DeadLettered)).await;
    pool.shutdown().await.unwrap();

    assert_eq!(handler.attempts.lock()[&poison], 1);
    assert_eq!(queue.dead_letter_list(), vec![poison]);
    assert_eq!(queue.status(&dependent), Ok(JobState::Blocked));
}

#[test_log::test(tokio::test)]
async fn test_reaper_recovers_abandoned_lease() {
    let queue = Arc::new(TaskQueue::new(fast_config()).unwrap());

    // A worker leases the job and dies without reporting
    let job_id = submit(&queue, "abandoned", &[]);
    let abandoned = queue.dequeue_for_worker().unwrap();
    assert_eq!(abandoned.attempt, 1);

    let reaper = LeaseReaper::with_interval(queue.clone(), Duration::from_millis(10)).spawn();
    let handler = Arc::new(RecordingHandler::default());
    let pool = WorkerPool::start(queue.clone(), handler.clone(), 1);

    wait_until(|| queue.status(&job_id) == Ok(JobState::Succeeded)).await;
    pool.shutdown().await.unwrap();
    reaper.shutdown().await.unwrap();

    let record = queue.record(&job_id).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_error.as_deref(), Some("lease expired"));
    assert_eq!(*handler.handled.lock(), vec!["abandoned".to_string()]);
}

/// The first run of "stalls" outlives its lease; everything else returns at once
#[derive(Default)]
struct StallingHandler {
    finished: Mutex<Vec<u32>>,
}

#[async_trait]
impl JobHandler<String> for StallingHandler {
    async fn handle(&self, job: LeasedJob<String>) -> Result<(), JobError> {
        if job.payload() == "stalls" && job.attempt == 1 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.finished.lock().push(job.attempt);
        Ok(())
    }
}

#[test_log::test(tokio::test)]
async fn test_stalled_worker_result_is_dropped_after_reap() {
    let queue = Arc::new(TaskQueue::new(fast_config()).unwrap());
    let handler = Arc::new(StallingHandler::default());

    let job_id = submit(&queue, "stalls", &[]);
    let dependent = submit(&queue, "after-stall", &["stalls"]);
    let reaper = LeaseReaper::with_interval(queue.clone(), Duration::from_millis(10)).spawn();
    let pool = WorkerPool::start_with(
        queue.clone(),
        handler.clone(),
        WorkerOptions {
            concurrency: 2,
            idle_backoff: Duration::from_millis(5),
        },
    );

    // Both runs of "stalls" and the single run of its dependent return
    wait_until(|| handler.finished.lock().len() == 3).await;
    pool.shutdown().await.unwrap();
    reaper.shutdown().await.unwrap();

    let record = queue.record(&job_id).unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.attempts, 2);
    assert_eq!(queue.status(&dependent), Ok(JobState::Succeeded));
    assert_eq!(queue.stats().metrics.jobs_succeeded, 2);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_idle_pool() {
    let queue: Arc<TaskQueue<String>> = Arc::new(TaskQueue::new(QueueConfig::default()).unwrap());
    let pool = WorkerPool::start(queue, Arc::new(RecordingHandler::default()), 4);

    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown().await.unwrap();
}
