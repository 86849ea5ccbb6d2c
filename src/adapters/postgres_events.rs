use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{GatewayEvent, WebhookEvent, WebhookEventStatus};
use crate::ports::{EventStore, RecordOutcome, RepositoryError, RepositoryResult};

const EVENT_COLUMNS: &str =
    "id, event_id, event_type, status, payload, error, created_at, processed_at";

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn status_of(&self, event_id: &str) -> RepositoryResult<Option<WebhookEventStatus>> {
        let status = sqlx::query_scalar::<_, WebhookEventStatus>(
            "SELECT status FROM webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn record_if_new(&self, event: &GatewayEvent) -> RepositoryResult<RecordOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (id, event_id, event_type, status, payload, created_at)
            VALUES ($1, $2, $3, 'PENDING', $4, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(RecordOutcome {
                is_new: true,
                status: WebhookEventStatus::Pending,
            });
        }

        let status = self
            .status_of(&event.id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook event {}", event.id)))?;
        Ok(RecordOutcome {
            is_new: false,
            status,
        })
    }

    async fn get(&self, event_id: &str) -> RepositoryResult<Option<WebhookEvent>> {
        let sql = format!("SELECT {} FROM webhook_events WHERE event_id = $1", EVENT_COLUMNS);
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookEventRow::into_domain)
            .transpose()
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> RepositoryResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_events SET status = 'FAILED', error = $2
            WHERE event_id = $1 AND status <> 'PROCESSED'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && self.status_of(event_id).await?.is_none() {
            return Err(RepositoryError::NotFound(format!("webhook event {}", event_id)));
        }
        Ok(())
    }

    async fn reset_for_replay(&self, event_id: &str) -> RepositoryResult<WebhookEvent> {
        let sql = format!(
            "UPDATE webhook_events SET status = 'PENDING', error = NULL \
             WHERE event_id = $1 AND status = 'FAILED' RETURNING {}",
            EVENT_COLUMNS
        );
        let reset = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        match reset {
            Some(row) => row.into_domain(),
            None => match self.status_of(event_id).await? {
                Some(status) => Err(RepositoryError::Conflict(format!(
                    "webhook event {} is {:?}, only failed events can be replayed",
                    event_id, status
                ))),
                None => Err(RepositoryError::NotFound(format!("webhook event {}", event_id))),
            },
        }
    }

    async fn list_by_status(
        &self,
        status: WebhookEventStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookEvent>> {
        let sql = format!(
            "SELECT {} FROM webhook_events WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WebhookEventRow::into_domain)
            .collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    event_id: String,
    event_type: String,
    status: WebhookEventStatus,
    payload: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl WebhookEventRow {
    fn into_domain(self) -> RepositoryResult<WebhookEvent> {
        Ok(WebhookEvent {
            id: self.id,
            event_id: self.event_id,
            event_type: self.event_type,
            status: self.status,
            payload: self.payload,
            error: self.error,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}
