use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event already authenticated by the transport boundary.
/// `id` is the idempotency key end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn from_gateway(event: &GatewayEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            status: WebhookEventStatus::Pending,
            payload: event.payload.clone(),
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Rebuilds the event as it was first delivered, for replay.
    pub fn to_gateway(&self) -> GatewayEvent {
        GatewayEvent {
            id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_FAILED: &str = "payment_intent.payment_failed";
pub const PAYMENT_CANCELED: &str = "payment_intent.canceled";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const CHARGE_REFUNDED: &str = "charge.refunded";
pub const TRANSFER_CREATED: &str = "transfer.created";
pub const APPLICATION_FEE_CREATED: &str = "application_fee.created";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    #[serde(default)]
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_received: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub application_fee_amount: Option<i64>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
    #[serde(default)]
    pub metadata: GatewayMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: GatewayMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    pub amount: i64,
    pub amount_refunded: i64,
    pub currency: String,
    #[serde(default)]
    pub refunds: RefundList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub destination: Option<String>,
    /// Charge the transfer was funded from.
    #[serde(default)]
    pub source_transaction: Option<String>,
    #[serde(default)]
    pub metadata: GatewayMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationFeeObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub charge: String,
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEventKind {
    PaymentSucceeded(PaymentIntentObject),
    PaymentFailed(PaymentIntentObject),
    PaymentCanceled(PaymentIntentObject),
    CheckoutSessionExpired(CheckoutSessionObject),
    ChargeRefunded(ChargeObject),
    TransferCreated(TransferObject),
    ApplicationFeeCreated(ApplicationFeeObject),
    Unknown(String),
}

impl GatewayEvent {
    /// Decodes the payload according to the event type.
    pub fn kind(&self) -> Result<GatewayEventKind, serde_json::Error> {
        let payload = self.payload.clone();
        let kind = match self.event_type.as_str() {
            PAYMENT_SUCCEEDED => GatewayEventKind::PaymentSucceeded(serde_json::from_value(payload)?),
            PAYMENT_FAILED => GatewayEventKind::PaymentFailed(serde_json::from_value(payload)?),
            PAYMENT_CANCELED => GatewayEventKind::PaymentCanceled(serde_json::from_value(payload)?),
            CHECKOUT_SESSION_EXPIRED => {
                GatewayEventKind::CheckoutSessionExpired(serde_json::from_value(payload)?)
            }
            CHARGE_REFUNDED => GatewayEventKind::ChargeRefunded(serde_json::from_value(payload)?),
            TRANSFER_CREATED => GatewayEventKind::TransferCreated(serde_json::from_value(payload)?),
            APPLICATION_FEE_CREATED => {
                GatewayEventKind::ApplicationFeeCreated(serde_json::from_value(payload)?)
            }
            other => GatewayEventKind::Unknown(other.to_string()),
        };
        Ok(kind)
    }
}
