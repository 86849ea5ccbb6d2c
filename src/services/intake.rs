use serde::Serialize;
use std::sync::Arc;

use crate::domain::{GatewayEvent, WebhookEventStatus};
use crate::ports::{EventStore, JobOptions, JobQueue, RepositoryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// A job was queued for the event.
    Enqueued,
    /// A job for this event id is already waiting or running.
    AlreadyQueued,
    /// The event was processed before; nothing queued.
    Duplicate,
}

#[derive(Clone)]
pub struct EventIntake {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn JobQueue>,
    options: JobOptions,
}

impl EventIntake {
    pub fn new(events: Arc<dyn EventStore>, queue: Arc<dyn JobQueue>, options: JobOptions) -> Self {
        Self {
            events,
            queue,
            options,
        }
    }

    pub async fn accept(&self, event: &GatewayEvent) -> RepositoryResult<IntakeOutcome> {
        let recorded = self.events.record_if_new(event).await?;
        if recorded.status == WebhookEventStatus::Processed {
            tracing::debug!(event_id = %event.id, "Duplicate delivery of a processed event");
            return Ok(IntakeOutcome::Duplicate);
        }

        let outcome = self.enqueue(event).await?;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            first_seen = recorded.is_new,
            outcome = ?outcome,
            "Event accepted"
        );
        Ok(outcome)
    }

    /// Re-queues a FAILED event from its stored payload. Any other status is
    /// a conflict.
    pub async fn replay(&self, event_id: &str) -> RepositoryResult<IntakeOutcome> {
        let stored = self.events.reset_for_replay(event_id).await?;
        let outcome = self.enqueue(&stored.to_gateway()).await?;
        tracing::info!(event_id = %event_id, outcome = ?outcome, "Event replayed");
        Ok(outcome)
    }

    async fn enqueue(&self, event: &GatewayEvent) -> RepositoryResult<IntakeOutcome> {
        if self.queue.enqueue(event, self.options).await? {
            Ok(IntakeOutcome::Enqueued)
        } else {
            Ok(IntakeOutcome::AlreadyQueued)
        }
    }
}
