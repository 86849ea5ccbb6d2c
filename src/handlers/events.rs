use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::domain::GatewayEvent;
use crate::error::AppError;
use crate::AppState;

/// Intake for events whose signature the edge already verified.
pub async fn accept_event(
    State(state): State<AppState>,
    Json(event): Json<GatewayEvent>,
) -> Result<impl IntoResponse, AppError> {
    if event.id.trim().is_empty() {
        return Err(AppError::Validation("event id must not be empty".to_string()));
    }
    if event.event_type.trim().is_empty() {
        return Err(AppError::Validation("event type must not be empty".to_string()));
    }

    let outcome = state.intake.accept(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": event.id,
            "outcome": outcome,
        })),
    ))
}
