use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::GatewayEvent;
use crate::ports::{
    DeadLetter, JobOptions, JobQueue, LeasedJob, NackOutcome, RepositoryError, RepositoryResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct Job {
    event: GatewayEvent,
    state: JobState,
    attempts: u32,
    options: JobOptions,
    run_at: DateTime<Utc>,
    seq: u64,
    last_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Jobs {
    by_id: HashMap<String, Job>,
    next_seq: u64,
}

/// Same contract as the Postgres queue: one job per event id, exponential
/// backoff, dead letter after the last attempt.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Jobs>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, Jobs> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs waiting or in flight.
    pub fn outstanding(&self) -> usize {
        self.jobs()
            .by_id
            .values()
            .filter(|job| matches!(job.state, JobState::Waiting | JobState::Active))
            .count()
    }
}

fn to_chrono(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, event: &GatewayEvent, options: JobOptions) -> RepositoryResult<bool> {
        let mut jobs = self.jobs();
        let seq = jobs.next_seq;
        jobs.next_seq += 1;

        if let Some(job) = jobs.by_id.get_mut(&event.id) {
            if matches!(job.state, JobState::Waiting | JobState::Active) {
                return Ok(false);
            }
            // Finished jobs may be queued again, e.g. on replay.
            *job = Job {
                event: event.clone(),
                state: JobState::Waiting,
                attempts: 0,
                options,
                run_at: Utc::now(),
                seq,
                last_error: None,
                finished_at: None,
            };
            return Ok(true);
        }

        jobs.by_id.insert(
            event.id.clone(),
            Job {
                event: event.clone(),
                state: JobState::Waiting,
                attempts: 0,
                options,
                run_at: Utc::now(),
                seq,
                last_error: None,
                finished_at: None,
            },
        );
        Ok(true)
    }

    async fn dequeue(&self) -> RepositoryResult<Option<LeasedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs();
        let next = jobs
            .by_id
            .iter()
            .filter(|(_, job)| job.state == JobState::Waiting && job.run_at <= now)
            .min_by_key(|(_, job)| (job.run_at, job.seq))
            .map(|(id, _)| id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.by_id.get_mut(&job_id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;

        Ok(Some(LeasedJob {
            job_id,
            event: job.event.clone(),
            attempt: job.attempts,
            max_attempts: job.options.max_attempts,
        }))
    }

    async fn ack(&self, job_id: &str) -> RepositoryResult<()> {
        let mut jobs = self.jobs();
        let job = jobs
            .by_id
            .get_mut(job_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("job {}", job_id)))?;
        job.state = JobState::Completed;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn nack(&self, job_id: &str, error: &str) -> RepositoryResult<NackOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs();
        let job = jobs
            .by_id
            .get_mut(job_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("job {}", job_id)))?;
        job.last_error = Some(error.to_string());

        if job.attempts >= job.options.max_attempts {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            return Ok(NackOutcome::DeadLettered {
                attempts: job.attempts,
            });
        }

        job.state = JobState::Waiting;
        job.run_at = now + to_chrono(job.options.delay_after(job.attempts));
        Ok(NackOutcome::Retrying {
            attempt: job.attempts,
            run_at: job.run_at,
        })
    }

    async fn dead_letters(&self, limit: i64) -> RepositoryResult<Vec<DeadLetter>> {
        let jobs = self.jobs();
        let mut failed: Vec<DeadLetter> = jobs
            .by_id
            .iter()
            .filter(|(_, job)| job.state == JobState::Failed)
            .map(|(id, job)| DeadLetter {
                job_id: id.clone(),
                event: job.event.clone(),
                attempts: job.attempts,
                last_error: job.last_error.clone(),
                failed_at: job.finished_at.unwrap_or(job.run_at),
            })
            .collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn prune(&self, keep_completed: i64, keep_failed: i64) -> RepositoryResult<u64> {
        let mut jobs = self.jobs();
        let mut doomed = Vec::new();

        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let mut finished: Vec<(&String, Option<DateTime<Utc>>, u64)> = jobs
                .by_id
                .iter()
                .filter(|(_, job)| job.state == state)
                .map(|(id, job)| (id, job.finished_at, job.seq))
                .collect();
            finished.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));
            doomed.extend(
                finished
                    .into_iter()
                    .skip(keep.max(0) as usize)
                    .map(|(id, _, _)| id.clone()),
            );
        }

        for id in &doomed {
            jobs.by_id.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
