use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

use crate::domain::GatewayEvent;
use crate::ports::{
    DeadLetter, JobOptions, JobQueue, LeasedJob, NackOutcome, RepositoryError, RepositoryResult,
};

/// How long a worker may hold a job before another worker may take it over.
const JOB_LEASE_SECS: i64 = 300;

/// Workers claim jobs with `FOR UPDATE SKIP LOCKED`. A claimed job whose
/// lease runs out becomes claimable again, which makes delivery at-least-once.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, event: &GatewayEvent, options: JobOptions) -> RepositoryResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_jobs (job_id, event, state, attempts, max_attempts, backoff_ms, run_at)
            VALUES ($1, $2, 'waiting', 0, $3, $4, NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                event = EXCLUDED.event,
                state = 'waiting',
                attempts = 0,
                max_attempts = EXCLUDED.max_attempts,
                backoff_ms = EXCLUDED.backoff_ms,
                run_at = NOW(),
                last_error = NULL,
                finished_at = NULL
            WHERE webhook_jobs.state IN ('completed', 'failed')
            "#,
        )
        .bind(&event.id)
        .bind(Json(event))
        .bind(options.max_attempts as i32)
        .bind(options.backoff.as_millis() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn dequeue(&self) -> RepositoryResult<Option<LeasedJob>> {
        let row = sqlx::query_as::<_, LeasedRow>(
            r#"
            UPDATE webhook_jobs
            SET state = 'active',
                attempts = attempts + 1,
                run_at = NOW() + make_interval(secs => $1)
            WHERE job_id = (
                SELECT job_id FROM webhook_jobs
                WHERE state IN ('waiting', 'active') AND run_at <= NOW()
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_id, event, attempts, max_attempts
            "#,
        )
        .bind(JOB_LEASE_SECS as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LeasedJob {
            job_id: r.job_id,
            event: r.event.0,
            attempt: r.attempts.max(0) as u32,
            max_attempts: r.max_attempts.max(0) as u32,
        }))
    }

    async fn ack(&self, job_id: &str) -> RepositoryResult<()> {
        let updated = sqlx::query(
            "UPDATE webhook_jobs SET state = 'completed', finished_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn nack(&self, job_id: &str, error: &str) -> RepositoryResult<NackOutcome> {
        let mut tx = self.pool.begin().await?;

        let (attempts, max_attempts, backoff_ms): (i32, i32, i64) = sqlx::query_as(
            "SELECT attempts, max_attempts, backoff_ms FROM webhook_jobs WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("job {}", job_id)))?;

        let attempts = attempts.max(0) as u32;
        let options = JobOptions {
            max_attempts: max_attempts.max(0) as u32,
            backoff: Duration::from_millis(backoff_ms.max(0) as u64),
        };

        let outcome = if attempts >= options.max_attempts {
            sqlx::query(
                r#"
                UPDATE webhook_jobs SET state = 'failed', last_error = $2, finished_at = NOW()
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            NackOutcome::DeadLettered { attempts }
        } else {
            let delay = chrono::Duration::from_std(options.delay_after(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            let run_at = Utc::now() + delay;
            sqlx::query(
                r#"
                UPDATE webhook_jobs SET state = 'waiting', last_error = $2, run_at = $3
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(run_at)
            .execute(&mut *tx)
            .await?;
            NackOutcome::Retrying {
                attempt: attempts,
                run_at,
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn dead_letters(&self, limit: i64) -> RepositoryResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT job_id, event, attempts, last_error, finished_at
            FROM webhook_jobs
            WHERE state = 'failed'
            ORDER BY finished_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| DeadLetter {
                job_id: r.job_id,
                event: r.event.0,
                attempts: r.attempts.max(0) as u32,
                last_error: r.last_error,
                failed_at: r.finished_at.unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn prune(&self, keep_completed: i64, keep_failed: i64) -> RepositoryResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM webhook_jobs WHERE job_id IN (
                SELECT job_id FROM (
                    SELECT job_id, state,
                        ROW_NUMBER() OVER (PARTITION BY state ORDER BY finished_at DESC) AS rn
                    FROM webhook_jobs
                    WHERE state IN ('completed', 'failed')
                ) ranked
                WHERE (state = 'completed' AND rn > $1) OR (state = 'failed' AND rn > $2)
            )
            "#,
        )
        .bind(keep_completed)
        .bind(keep_failed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeasedRow {
    job_id: String,
    event: Json<GatewayEvent>,
    attempts: i32,
    max_attempts: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    job_id: String,
    event: Json<GatewayEvent>,
    attempts: i32,
    last_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}
