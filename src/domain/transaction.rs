use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::InvalidTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    BookingPayment,
    PlatformCommission,
    SellerPayout,
    BookingRefund,
    HostPayout,
}

impl TransactionType {
    /// Split and refund legs hang off a payment and draw down its amount.
    pub fn is_derived_leg(&self) -> bool {
        matches!(
            self,
            TransactionType::PlatformCommission
                | TransactionType::SellerPayout
                | TransactionType::BookingRefund
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    PartiallyRefunded,
    FullyRefunded,
}

impl TransactionStatus {
    /// Refund legs never regress and a late success may still land on a
    /// payment that expiry or failure closed first.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Success | Failed | Cancelled)
                | (Failed | Cancelled, Success)
                | (Success, PartiallyRefunded | FullyRefunded)
                | (PartiallyRefunded, PartiallyRefunded | FullyRefunded)
        )
    }

    /// Money was captured, whether or not some of it went back since.
    pub fn is_captured(self) -> bool {
        matches!(
            self,
            TransactionStatus::Success
                | TransactionStatus::PartiallyRefunded
                | TransactionStatus::FullyRefunded
        )
    }
}

/// Idempotency flag guarding the inventory release for one payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseMarker {
    #[serde(default)]
    pub tickets_released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_quantity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reinstated_at: Option<DateTime<Utc>>,
}

/// Gateway and internal identifiers that tie a ledger row to its origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_fee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_request_id: Option<Uuid>,
}

/// Audit side-channel stored next to each ledger row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerMarkers {
    #[serde(default)]
    pub release: ReleaseMarker,
    #[serde(default)]
    pub correlation: CorrelationIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A single money movement. Settled rows are only ever moved forward
/// through the refund legs; rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub payer_id: Option<String>,
    pub payee_id: Option<String>,
    pub parent_transaction_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub external_txn_id: Option<String>,
    pub markers: LedgerMarkers,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(transaction_type: TransactionType, amount: BigDecimal, currency: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transaction_type,
            status: TransactionStatus::Pending,
            amount,
            currency,
            payer_id: None,
            payee_id: None,
            parent_transaction_id: None,
            booking_id: None,
            payment_intent_id: None,
            charge_id: None,
            transfer_id: None,
            external_txn_id: None,
            markers: LedgerMarkers::default(),
            created_at: now,
            updated_at: now,
            processed_at: None,
            settled_at: None,
        }
    }

    /// A row created already settled, e.g. a commission or payout leg.
    pub fn settled(
        transaction_type: TransactionType,
        amount: BigDecimal,
        currency: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TransactionStatus::Success,
            processed_at: Some(now),
            settled_at: Some(now),
            ..Self::new(transaction_type, amount, currency)
        }
    }

    pub fn transition(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                entity: "transaction",
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }

        match next {
            TransactionStatus::Success => {
                self.processed_at = Some(now);
                self.settled_at = Some(now);
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                self.processed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
