use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::domain::WebhookEventStatus;
use crate::error::AppError;
use crate::AppState;

const DEFAULT_ADMIN_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct WebhookEventQuery {
    pub status: Option<WebhookEventStatus>,
    pub limit: Option<i64>,
}

/// FAILED events unless another status is asked for.
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<WebhookEventQuery>,
) -> Result<impl IntoResponse, AppError> {
    let status = query.status.unwrap_or(WebhookEventStatus::Failed);
    let limit = query.limit.unwrap_or(DEFAULT_ADMIN_LIMIT).clamp(1, 500);
    let events = state.events.list_by_status(status, limit).await?;

    Ok(Json(json!({
        "events": events,
        "count": events.len(),
    })))
}

/// Re-queues a FAILED event from its stored payload. The signature was
/// verified on first delivery and is not checked again.
pub async fn replay_webhook_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.intake.replay(&event_id).await?;
    tracing::info!(event_id = %event_id, "Webhook event replay requested");

    Ok(Json(json!({
        "event_id": event_id,
        "outcome": outcome,
    })))
}

pub async fn list_dead_letters(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let jobs = state.queue.dead_letters(DEFAULT_ADMIN_LIMIT).await?;

    Ok(Json(json!({
        "dead_letters": jobs,
        "count": jobs.len(),
    })))
}

pub async fn approve_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let approved = state.withdrawals.approve(id).await?;
    Ok(Json(approved))
}
