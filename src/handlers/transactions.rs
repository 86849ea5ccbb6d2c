use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{TransactionStatus, TransactionType};
use crate::error::AppError;
use crate::ports::TransactionFilter;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub payer_id: Option<String>,
    pub payee_id: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let filter = TransactionFilter {
        payer_id: params.payer_id,
        payee_id: params.payee_id,
        transaction_type: params.transaction_type,
        status: params.status,
        from: params.from,
        to: params.to,
    };

    let page = state
        .ledger
        .list(&filter, params.limit, params.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let graph = state.ledger.graph(id).await?;
    Ok(Json(graph))
}
