use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a batch holds: loyalty points of a user, or the value left on a coupon code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchKind {
    Points,
    CouponValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Active,
    Redeemed,
    Expired,
}

/// A quantity granted at one point in time. `remaining` only ever goes down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarnBatch {
    pub id: Uuid,
    pub kind: BatchKind,
    pub subject_id: String,
    pub earned: BigDecimal,
    pub remaining: BigDecimal,
    pub status: BatchStatus,
    pub earned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EarnBatch {
    pub fn new(
        kind: BatchKind,
        subject_id: String,
        earned: BigDecimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_id,
            remaining: earned.clone(),
            earned,
            status: BatchStatus::Active,
            earned_at: now,
            expires_at,
            updated_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    pub batch_id: Uuid,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub consumed: BigDecimal,
    pub deductions: Vec<Deduction>,
}
