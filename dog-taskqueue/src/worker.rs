use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{engine::TaskQueue, retry::RetryAction, JobError, LeasedJob, QueueError, QueueResult};

/// Executes leased jobs.
///
/// `Err(JobError::Retryable)` consumes one retry; `Err(JobError::Permanent)`
/// dead-letters the job immediately.
#[async_trait]
pub trait JobHandler<P>: Send + Sync + 'static {
    async fn handle(&self, job: LeasedJob<P>) -> Result<(), JobError>;
}

/// Worker pool settings
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Number of worker tasks
    pub concurrency: usize,
    /// Sleep between polls when there is no work
    pub idle_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_backoff: Duration::from_millis(100),
        }
    }
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<QueueResult<()>>,
}

impl WorkerHandle {
    /// Gracefully shutdown the worker; a job in progress is finished first
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        match self.join_handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(QueueError::WorkerShutdown),
            Err(e) => Err(QueueError::Internal(format!("Worker join error: {}", e))),
        }
    }
}

/// A set of tokio workers draining one queue
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Start `concurrency` workers with the default idle backoff
    pub fn start<P, H>(queue: Arc<TaskQueue<P>>, handler: Arc<H>, concurrency: usize) -> Self
    where
        P: Send + Sync + 'static,
        H: JobHandler<P>,
    {
        Self::start_with(
            queue,
            handler,
            WorkerOptions {
                concurrency,
                ..WorkerOptions::default()
            },
        )
    }

    pub fn start_with<P, H>(queue: Arc<TaskQueue<P>>, handler: Arc<H>, options: WorkerOptions) -> Self
    where
        P: Send + Sync + 'static,
        H: JobHandler<P>,
    {
        let workers = (0..options.concurrency.max(1))
            .map(|index| {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let worker = Worker {
                    index,
                    queue: Arc::clone(&queue),
                    handler: Arc::clone(&handler),
                    idle_backoff: options.idle_backoff,
                    shutdown_rx,
                };
                let join_handle = tokio::spawn(worker.run());
                WorkerHandle {
                    shutdown_tx,
                    join_handle,
                }
            })
            .collect::<Vec<_>>();

        info!("Started {} workers", workers.len());
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker; returns the first error encountered
    pub async fn shutdown(self) -> QueueResult<()> {
        let mut result = Ok(());
        for worker in self.workers {
            if let Err(err) = worker.shutdown().await {
                error!("Worker shutdown failed: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Worker for processing jobs from the queue
struct Worker<P, H> {
    index: usize,
    queue: Arc<TaskQueue<P>>,
    handler: Arc<H>,
    idle_backoff: Duration,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<P, H> Worker<P, H>
where
    P: Send + Sync + 'static,
    H: JobHandler<P>,
{
    /// Run the worker loop
    async fn run(mut self) -> QueueResult<()> {
        debug!("Worker {} started", self.index);

        loop {
            if !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let processed = match self.process_next_job().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!("Error processing job: {}", e);
                    false
                }
            };
            if processed {
                continue;
            }

            // No jobs available, wait a bit
            tokio::select! {
                _ = &mut self.shutdown_rx => break,
                _ = tokio::time::sleep(self.idle_backoff) => {}
            }
        }

        debug!("Worker {} stopped", self.index);
        Ok(())
    }

    /// Process the next available job
    async fn process_next_job(&self) -> QueueResult<bool> {
        let Some(job) = self.queue.dequeue_for_worker() else {
            return Ok(false);
        };
        let job_id = job.job_id.clone();
        let lease_token = job.lease_token.clone();
        debug!("Worker {} processing job {} (attempt {})", self.index, job_id, job.attempt);

        let outcome = match self.handler.handle(job).await {
            Ok(()) => self
                .queue
                .report_success_with_lease(&job_id, &lease_token)
                .map(|()| info!("Job {} completed successfully", job_id)),
            Err(job_error) => self
                .queue
                .report_failure_with_lease(&job_id, &lease_token, job_error)
                .map(|action| match action {
                    RetryAction::Retry { retry, .. } => {
                        warn!("Job {} failed, retry {} scheduled", job_id, retry)
                    }
                    RetryAction::DeadLetter { failures } => {
                        error!("Job {} failed permanently after {} failures", job_id, failures)
                    }
                }),
        };

        match outcome {
            // The lease was reaped while the handler ran; the next run owns the job
            Err(QueueError::InvalidLeaseToken(_)) => {
                warn!("Worker {} lost the lease on job {}, result dropped", self.index, job_id)
            }
            other => other?,
        }

        Ok(true)
    }
}
