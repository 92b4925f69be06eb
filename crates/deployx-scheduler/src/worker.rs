//! Fixed-size worker pool draining the dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::{Disposition, ExecutionEngine};
use crate::queue::{Delivery, DispatchQueue};

/// A worker that claims and executes one job at a time.
pub struct Worker {
    id: String,
    queue: Arc<dyn DispatchQueue>,
    engine: Arc<ExecutionEngine>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn DispatchQueue>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            engine,
        }
    }

    /// Run the worker loop until `shutdown` flips to `true`. A job already
    /// running is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Starting worker");
        let poll = self.engine.config().queue_poll_interval;

        while !*shutdown.borrow() {
            let idle = match self.queue.receive(&self.id).await {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                    continue;
                }
                Ok(None) => poll,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to receive from queue");
                    poll * 5
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    // pool handle dropped
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.payload.job_id;
        let poll = self.engine.config().queue_poll_interval;

        let result = match self.engine.process(&delivery.payload).await {
            Ok(Disposition::Done) => self.queue.ack(&delivery).await,
            Ok(Disposition::Requeue) => self.queue.requeue(&delivery, poll).await,
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Job processing failed");
                self.queue.requeue(&delivery, poll * 5).await
            }
        };

        if let Err(e) = result {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to settle delivery");
        }
    }
}

/// Handle to a running pool.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `engine.config().workers` workers (at least one).
    pub fn spawn(engine: Arc<ExecutionEngine>, queue: Arc<dyn DispatchQueue>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let count = engine.config().workers.max(1);

        let workers = (0..count)
            .map(|i| {
                let worker = Worker::new(format!("worker-{}", i), queue.clone(), engine.clone());
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self { shutdown, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new jobs and wait for in-flight jobs to finish, up to `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let joined = futures::future::join_all(self.workers);
        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!("Worker pool did not stop within the grace period");
        }
    }
}
