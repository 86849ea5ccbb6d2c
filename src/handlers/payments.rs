use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::CheckoutRequest;
use crate::AppState;

pub async fn start_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.checkout.start_checkout(&request).await?;
    let status = if session.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(session)))
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub amount: BigDecimal,
    pub reason: Option<String>,
}

pub async fn initiate_refund(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> Result<impl IntoResponse, AppError> {
    let initiated = state
        .refunds
        .initiate(payment_id, &body.amount, body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(initiated)))
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub amount: BigDecimal,
}

pub async fn redeem_points(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<RedeemBody>,
) -> Result<impl IntoResponse, AppError> {
    let allocation = state.rewards.redeem_points(&user_id, &body.amount).await?;
    Ok(Json(allocation))
}

pub async fn redeem_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<RedeemBody>,
) -> Result<impl IntoResponse, AppError> {
    let allocation = state.rewards.redeem_coupon(&code, &body.amount).await?;
    Ok(Json(allocation))
}
