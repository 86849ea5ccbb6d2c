use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::InvalidTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
    Refunded,
}

impl BookingStatus {
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Cancelled | Expired | Refunded)
                | (Confirmed, Refunded)
                | (Cancelled | Expired, Confirmed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub host_id: String,
    pub experience_id: Uuid,
    pub event_id: Uuid,
    pub quantity: i32,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub status: BookingStatus,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn transition(
        &mut self,
        next: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                entity: "booking",
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Seat capacity of one scheduled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInventory {
    pub event_id: Uuid,
    pub capacity: i32,
    pub available: i32,
}

impl EventInventory {
    /// Returns how many seats actually went back; never exceeds capacity.
    pub fn release(&mut self, quantity: i32) -> i32 {
        let released = quantity.max(0).min(self.capacity - self.available);
        self.available += released;
        released
    }

    /// Takes seats if enough are free; leaves the counter untouched otherwise.
    pub fn hold(&mut self, quantity: i32) -> bool {
        if quantity <= 0 || quantity > self.available {
            return false;
        }
        self.available -= quantity;
        true
    }
}
