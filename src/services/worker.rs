use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ports::{EventStore, JobQueue, LeasedJob, NackOutcome, RepositoryResult};
use crate::services::webhook::{HandlerOutcome, WebhookProcessor};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub prune_interval: Duration,
    pub keep_completed: i64,
    pub keep_failed: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            prune_interval: Duration::from_secs(60),
            keep_completed: 1000,
            keep_failed: 5000,
        }
    }
}

/// What became of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Completed(HandlerOutcome),
    /// Terminal business failure: event marked FAILED, job acknowledged.
    Rejected(String),
    Retrying { attempt: u32, run_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
}

/// Each worker runs `dequeue -> process -> ack/nack` on its own, so a slow
/// handler only blocks its own worker.
#[derive(Clone)]
pub struct WorkerPool {
    processor: WebhookProcessor,
    queue: Arc<dyn JobQueue>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(processor: WebhookProcessor, queue: Arc<dyn JobQueue>, settings: WorkerSettings) -> Self {
        Self {
            processor,
            queue,
            settings,
        }
    }

    fn events(&self) -> &Arc<dyn EventStore> {
        self.processor.events()
    }

    /// Takes one ready job, if any, and settles it.
    pub async fn run_once(&self) -> RepositoryResult<Option<JobResult>> {
        match self.queue.dequeue().await? {
            Some(job) => Ok(Some(self.handle(job).await?)),
            None => Ok(None),
        }
    }

    /// Works until no job is ready. Jobs waiting on backoff are left alone.
    pub async fn drain(&self) -> RepositoryResult<Vec<JobResult>> {
        let mut results = Vec::new();
        while let Some(result) = self.run_once().await? {
            results.push(result);
        }
        Ok(results)
    }

    async fn handle(&self, job: LeasedJob) -> RepositoryResult<JobResult> {
        let event_id = job.event.id.clone();

        match self.processor.process(&job.event).await {
            Ok(outcome) => {
                self.queue.ack(&job.job_id).await?;
                Ok(JobResult::Completed(outcome))
            }
            Err(e) if e.is_retryable() => {
                let reason = e.to_string();
                match self.queue.nack(&job.job_id, &reason).await? {
                    NackOutcome::Retrying { attempt, run_at } => {
                        warn!(
                            event_id = %event_id,
                            attempt,
                            max_attempts = job.max_attempts,
                            retry_at = %run_at,
                            "Event processing failed, will retry: {}",
                            reason
                        );
                        Ok(JobResult::Retrying { attempt, run_at })
                    }
                    NackOutcome::DeadLettered { attempts } => {
                        error!(
                            event_id = %event_id,
                            attempts,
                            "Event dead-lettered: {}",
                            reason
                        );
                        self.events()
                            .mark_failed(
                                &event_id,
                                &format!("gave up after {} attempts: {}", attempts, reason),
                            )
                            .await?;
                        Ok(JobResult::DeadLettered { attempts })
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(event_id = %event_id, "Event rejected: {}", reason);
                self.events().mark_failed(&event_id, &reason).await?;
                self.queue.ack(&job.job_id).await?;
                Ok(JobResult::Rejected(reason))
            }
        }
    }

    /// Spawns the workers and the retention pruner. All of them stop once
    /// `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.settings.concurrency + 1);

        for worker_id in 0..self.settings.concurrency.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.work(worker_id, shutdown).await;
            }));
        }

        let pool = self;
        handles.push(tokio::spawn(async move {
            pool.prune_loop(shutdown).await;
        }));
        handles
    }

    async fn work(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Event worker started");

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(Some(result)) => {
                    debug!(worker_id, result = ?result, "Job settled");
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker_id, "Worker queue error: {}", e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(self.settings.poll_interval) => {}
            }
        }

        info!(worker_id, "Event worker stopped");
    }

    async fn prune_loop(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self
                .queue
                .prune(self.settings.keep_completed, self.settings.keep_failed)
                .await
            {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "Pruned finished jobs"),
                Err(e) => error!("Job pruning failed: {}", e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(self.settings.prune_interval) => {}
            }
        }
    }
}
