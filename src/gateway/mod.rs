pub mod client;
pub mod fake;

pub use client::{HttpGateway, RetryPolicy};
pub use fake::FakeGateway;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Gateway rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid response from gateway: {0}")]
    InvalidResponse(String),
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

impl GatewayError {
    /// Network trouble, throttling and 5xx may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RequestError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            GatewayError::CircuitBreakerOpen(_) => true,
            GatewayError::InvalidResponse(_) => false,
        }
    }
}

/// Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePaymentIntent {
    pub amount: i64,
    pub currency: String,
    pub application_fee_amount: Option<i64>,
    pub destination: Option<String>,
    pub booking_id: Uuid,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPaymentIntent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRefund {
    pub payment_intent: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub amount: i64,
    pub currency: String,
    pub destination: String,
    pub withdrawal_request_id: Uuid,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransfer {
    pub id: String,
    pub amount: i64,
}
