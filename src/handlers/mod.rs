pub mod admin;
pub mod events;
pub mod payments;
pub mod transactions;

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub queue: String,
    pub dead_letters: Option<usize>,
}

/// Reports unhealthy when the job queue cannot be read.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (queue, dead_letters) = match state.queue.dead_letters(100).await {
        Ok(jobs) => ("connected", Some(jobs.len())),
        Err(e) => {
            tracing::warn!("Health check could not reach the job queue: {}", e);
            ("disconnected", None)
        }
    };

    let healthy = dead_letters.is_some();
    let body = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue: queue.to_string(),
        dead_letters,
    };
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(body))
}
