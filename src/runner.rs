//! Worker pool driving the controller
//!
//! The runner feeds the work queue from the store's change feed and from
//! requeue timers, and runs a fixed number of workers that each reconcile
//! one key at a time. The queue guarantees no key is held by two workers.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{error_policy, reconcile, Action, Context};
use crate::queue::WorkQueue;
use crate::Error;

/// Bounded pool of reconciliation workers
#[derive(Clone)]
pub struct Runner {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
}

impl Runner {
    /// Create a runner over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            queue: Arc::new(WorkQueue::new()),
        }
    }

    /// The work queue, for enqueueing keys from outside the change feed
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Every known key is queued on start. In-flight passes are abandoned on
    /// shutdown; the next start re-observes them.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let mut changes = self.ctx.store.subscribe();
        self.resync().await?;

        let workers = self.ctx.config.workers.max(1);
        info!(workers, "starting reconciliation workers");

        let mut pool = JoinSet::new();
        for id in 0..workers {
            pool.spawn(worker(
                id,
                self.ctx.clone(),
                self.queue.clone(),
                shutdown.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(key) => {
                        debug!(resource = %key, "desired state changed");
                        self.queue.enqueue(key);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, resyncing");
                        if let Err(e) = self.resync().await {
                            error!(error = %e, "resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("change feed closed, waiting for shutdown");
                        shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!("shutting down reconciliation workers");
        self.queue.shutdown();
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        Ok(())
    }

    /// Queue every known key
    pub async fn resync(&self) -> Result<(), Error> {
        let keys = self.ctx.store.list().await?;
        debug!(count = keys.len(), "resyncing all records");
        for key in keys {
            self.queue.enqueue(key);
        }
        Ok(())
    }
}

async fn worker(
    id: usize,
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "worker started");

    while let Some(key) = queue.next().await {
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                queue.done(&key);
                break;
            }
            result = reconcile(key.clone(), ctx.clone()) => result,
        };

        let action = match result {
            Ok(action) => {
                queue.forget(&key);
                action
            }
            Err(error) => {
                let failures = queue.record_failure(&key);
                error_policy(&key, &error, failures, &ctx)
            }
        };

        if let Action::Requeue(delay) = action {
            queue.enqueue_after(key.clone(), delay);
        }
        queue.done(&key);
    }

    debug!(worker = id, "worker stopped");
}
