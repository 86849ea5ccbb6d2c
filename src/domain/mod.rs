use bigdecimal::{BigDecimal, ToPrimitive};
use thiserror::Error;

pub mod batch;
pub mod booking;
pub mod transaction;
pub mod webhook_event;
pub mod withdrawal;

pub use batch::{Allocation, BatchKind, BatchStatus, Deduction, EarnBatch};
pub use booking::{Booking, BookingStatus, EventInventory};
pub use transaction::{
    CorrelationIds, LedgerMarkers, ReleaseMarker, Transaction, TransactionStatus,
    TransactionType,
};
pub use webhook_event::{GatewayEvent, GatewayEventKind, WebhookEvent, WebhookEventStatus};
pub use withdrawal::{WithdrawalRequest, WithdrawalStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Gateway amounts are integers in minor units with two decimal places.
pub fn from_minor_units(amount: i64) -> BigDecimal {
    (BigDecimal::from(amount) / BigDecimal::from(100)).with_scale(2)
}

/// `None` when the amount has sub-cent digits or does not fit.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    if amount.with_scale(2) != *amount {
        return None;
    }
    (amount * BigDecimal::from(100)).with_scale(0).to_i64()
}
