use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::{engine::TaskQueue, QueueError, QueueResult};

/// Background sweep that fails expired leases on the worker's behalf, prunes
/// idle rate-limit history and purges old archive markers
pub struct LeaseReaper<P> {
    queue: Arc<TaskQueue<P>>,
    interval: Duration,
}

impl<P: Send + Sync + 'static> LeaseReaper<P> {
    /// Create a reaper ticking at the queue's configured interval
    pub fn new(queue: Arc<TaskQueue<P>>) -> Self {
        let interval = queue.config().reaper_interval();
        Self { queue, interval }
    }

    /// Create reaper with custom interval
    pub fn with_interval(queue: Arc<TaskQueue<P>>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Run one sweep; returns the number of leases reclaimed
    pub fn reap_once(&self) -> usize {
        let reclaimed = self.queue.reap_expired().len();
        let pruned = self.queue.prune_rate_limits();
        let purged = self
            .queue
            .purge_archived(self.queue.config().archive_retention());

        if reclaimed > 0 {
            info!("Reclaimed {} expired leases", reclaimed);
        } else {
            debug!("No expired leases found");
        }
        if pruned > 0 {
            debug!("Pruned rate-limit history for {} idle owners", pruned);
        }
        if purged > 0 {
            debug!("Purged {} archived success markers", purged);
        }
        reclaimed
    }

    /// Start the sweep on the tokio runtime
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Starting lease reaper with interval: {:?}", self.interval);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Lease reaper shutdown requested");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reap_once();
                    }
                }
            }
        });

        ReaperHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

/// Handle for stopping a spawned [`LeaseReaper`]
pub struct ReaperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the sweep and wait for it to exit
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Reaper join error: {}", e)))
    }
}
