use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::domain::InvalidTransition;
use crate::gateway::GatewayError;
use crate::ports::RepositoryError;
use crate::services::allocator::{AllocationError, BatchError};
use crate::services::lock::LockError;

/// Failures inside the pipeline. `is_retryable` decides between queue
/// backoff and recording the event as FAILED.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Malformed event payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Missing linkage: {0}")]
    MissingLinkage(String),

    #[error("Sold out: {0}")]
    SoldOut(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

impl From<BatchError> for PipelineError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Allocation(inner) => PipelineError::Allocation(inner),
            BatchError::Repository(inner) => PipelineError::Repository(inner),
        }
    }
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Repository(e) => matches!(
                e,
                RepositoryError::Conflict(_) | RepositoryError::Unavailable(_)
            ),
            PipelineError::Lock(_) => true,
            PipelineError::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(msg) => AppError::NotFound(msg),
            RepositoryError::Conflict(msg) | RepositoryError::Duplicate(msg) => {
                AppError::Conflict(msg)
            }
            other => AppError::Storage(other.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Repository(inner) => inner.into(),
            PipelineError::Lock(LockError::Timeout { .. }) => {
                AppError::Conflict("resource is busy, try again".to_string())
            }
            PipelineError::Lock(inner) => AppError::Internal(inner.to_string()),
            PipelineError::Gateway(inner) => AppError::Upstream(inner.to_string()),
            PipelineError::NotFound(msg) => AppError::NotFound(msg),
            PipelineError::InvalidCursor(msg) => AppError::BadRequest(msg),
            PipelineError::Allocation(_)
            | PipelineError::MalformedPayload(_)
            | PipelineError::MissingLinkage(_) => AppError::Validation(e.to_string()),
            PipelineError::Transition(_) | PipelineError::Invariant(_) | PipelineError::SoldOut(_) => {
                AppError::Conflict(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
