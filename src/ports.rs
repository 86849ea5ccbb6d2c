use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    BatchKind, Booking, BookingStatus, EarnBatch, EventInventory, GatewayEvent, Transaction,
    TransactionStatus, TransactionType, WebhookEvent, WebhookEventStatus,
    WithdrawalRequest,
};
use crate::gateway::{
    CreatePaymentIntent, CreateRefund, CreateTransfer, GatewayError, GatewayPaymentIntent,
    GatewayRefund, GatewayTransfer,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(e.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => RepositoryError::Conflict(db.message().to_string()),
                Some("23505") => RepositoryError::Duplicate(db.message().to_string()),
                _ => RepositoryError::Unavailable(e.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RepositoryError::Corrupt(e.to_string())
            }
            _ => RepositoryError::Unavailable(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for RepositoryError {
    fn from(e: redis::RedisError) -> Self {
        RepositoryError::Unavailable(e.to_string())
    }
}

// --- Ledger ---

/// One atomic, serializable unit of ledger work. Lookups lock the rows they
/// return until commit or rollback.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Flips the event row to PROCESSED. Returns false if it already was.
    async fn claim_event(&mut self, event_id: &str) -> RepositoryResult<bool>;

    async fn transaction_by_id(&mut self, id: Uuid) -> RepositoryResult<Option<Transaction>>;
    async fn payment_by_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> RepositoryResult<Option<Transaction>>;
    async fn payment_by_charge(&mut self, charge_id: &str) -> RepositoryResult<Option<Transaction>>;
    async fn payment_by_booking(&mut self, booking_id: Uuid)
        -> RepositoryResult<Option<Transaction>>;
    async fn transaction_by_external_id(
        &mut self,
        external_txn_id: &str,
    ) -> RepositoryResult<Option<Transaction>>;
    async fn leg_by_charge(
        &mut self,
        transaction_type: TransactionType,
        charge_id: &str,
    ) -> RepositoryResult<Option<Transaction>>;
    async fn children_of(&mut self, parent_id: Uuid) -> RepositoryResult<Vec<Transaction>>;
    async fn insert_transaction(&mut self, tx: &Transaction) -> RepositoryResult<()>;
    async fn update_transaction(&mut self, tx: &Transaction) -> RepositoryResult<()>;

    async fn booking(&mut self, id: Uuid) -> RepositoryResult<Option<Booking>>;
    async fn pending_booking_for(
        &mut self,
        user_id: &str,
        experience_id: Uuid,
        event_id: Uuid,
    ) -> RepositoryResult<Option<Booking>>;
    async fn insert_booking(&mut self, booking: &Booking) -> RepositoryResult<()>;
    async fn update_booking(&mut self, booking: &Booking) -> RepositoryResult<()>;

    async fn inventory(&mut self, event_id: Uuid) -> RepositoryResult<Option<EventInventory>>;
    async fn save_inventory(&mut self, inventory: &EventInventory) -> RepositoryResult<()>;

    /// ACTIVE batches not yet expired at `now`, oldest earned first, ties
    /// broken by id. Batches past expiry stay out even before the sweep
    /// marks them.
    async fn active_batches(
        &mut self,
        kind: BatchKind,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<EarnBatch>>;
    async fn expired_batches(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<EarnBatch>>;
    async fn insert_batch(&mut self, batch: &EarnBatch) -> RepositoryResult<()>;
    async fn save_batch(&mut self, batch: &EarnBatch) -> RepositoryResult<()>;
    async fn adjust_balance(
        &mut self,
        kind: BatchKind,
        subject_id: &str,
        delta: &BigDecimal,
    ) -> RepositoryResult<BigDecimal>;

    async fn withdrawal_request(&mut self, id: Uuid)
        -> RepositoryResult<Option<WithdrawalRequest>>;
    async fn save_withdrawal_request(&mut self, request: &WithdrawalRequest)
        -> RepositoryResult<()>;

    async fn commit(self: Box<Self>) -> RepositoryResult<()>;
    async fn rollback(self: Box<Self>) -> RepositoryResult<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub payer_id: Option<String>,
    pub payee_id: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.payer_id.as_ref().map_or(true, |p| tx.payer_id.as_ref() == Some(p))
            && self.payee_id.as_ref().map_or(true, |p| tx.payee_id.as_ref() == Some(p))
            && self.transaction_type.map_or(true, |t| tx.transaction_type == t)
            && self.status.map_or(true, |s| tx.status == s)
            && self.from.map_or(true, |from| tx.created_at >= from)
            && self.to.map_or(true, |to| tx.created_at < to)
    }
}

/// Keyset page: rows strictly after `after` in `created_at DESC, id DESC` order.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub limit: i64,
    pub after: Option<(DateTime<Utc>, Uuid)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionGraph {
    pub transaction: Transaction,
    pub parent: Option<Transaction>,
    pub children: Vec<Transaction>,
    pub booking: Option<Booking>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>>;

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        page: &PageRequest,
    ) -> RepositoryResult<Vec<Transaction>>;

    async fn transaction_graph(&self, id: Uuid) -> RepositoryResult<Option<TransactionGraph>>;

    async fn booking_status(&self, id: Uuid) -> RepositoryResult<Option<BookingStatus>>;

    async fn balance(&self, kind: BatchKind, subject_id: &str) -> RepositoryResult<BigDecimal>;
}

// --- Events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub is_new: bool,
    pub status: WebhookEventStatus,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates the row PENDING on first sight; otherwise reports the stored status.
    async fn record_if_new(&self, event: &GatewayEvent) -> RepositoryResult<RecordOutcome>;
    async fn get(&self, event_id: &str) -> RepositoryResult<Option<WebhookEvent>>;
    /// Never downgrades a PROCESSED row.
    async fn mark_failed(&self, event_id: &str, error: &str) -> RepositoryResult<()>;
    /// FAILED -> PENDING, clearing the error. Conflict for any other status.
    async fn reset_for_replay(&self, event_id: &str) -> RepositoryResult<WebhookEvent>;
    async fn list_by_status(
        &self,
        status: WebhookEventStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookEvent>>;
}

// --- Queue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl JobOptions {
    /// Delay before the retry that follows `attempt` (1-based): backoff * 2^(attempt-1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job_id: String,
    pub event: GatewayEvent,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    Retrying { attempt: u32, run_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job_id: String,
    pub event: GatewayEvent,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Job key is the event id. Returns false if an identical job is already
    /// waiting or in flight.
    async fn enqueue(&self, event: &GatewayEvent, options: JobOptions) -> RepositoryResult<bool>;
    async fn dequeue(&self) -> RepositoryResult<Option<LeasedJob>>;
    async fn ack(&self, job_id: &str) -> RepositoryResult<()>;
    async fn nack(&self, job_id: &str, error: &str) -> RepositoryResult<NackOutcome>;
    async fn dead_letters(&self, limit: i64) -> RepositoryResult<Vec<DeadLetter>>;
    /// Trims finished jobs down to the newest `keep_completed` / `keep_failed`.
    async fn prune(&self, keep_completed: i64, keep_failed: i64) -> RepositoryResult<u64>;
}

// --- Locks ---

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set-if-not-exists with expiry.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RepositoryResult<bool>;
    /// Atomically deletes `key` only if it still holds `token`.
    async fn compare_and_delete(&self, key: &str, token: &str) -> RepositoryResult<bool>;
}

// --- Payment gateway ---

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntent,
    ) -> Result<GatewayPaymentIntent, GatewayError>;
    async fn cancel_payment_intent(&self, id: &str) -> Result<(), GatewayError>;
    async fn retrieve_payment_intent(&self, id: &str) -> Result<GatewayPaymentIntent, GatewayError>;
    async fn create_refund(&self, request: &CreateRefund) -> Result<GatewayRefund, GatewayError>;
    async fn create_transfer(&self, request: &CreateTransfer)
        -> Result<GatewayTransfer, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let options = JobOptions::default();
        assert_eq!(options.delay_after(1), Duration::from_secs(2));
        assert_eq!(options.delay_after(2), Duration::from_secs(4));
        assert_eq!(options.delay_after(4), Duration::from_secs(16));
    }

    #[test]
    fn test_filter_matches_on_every_given_field() {
        let mut tx = Transaction::new(
            TransactionType::BookingPayment,
            BigDecimal::from(10),
            "usd".to_string(),
        );
        tx.payer_id = Some("user_1".to_string());

        let filter = TransactionFilter {
            payer_id: Some("user_1".to_string()),
            status: Some(TransactionStatus::Pending),
            ..Default::default()
        };
        assert!(filter.matches(&tx));

        let filter = TransactionFilter {
            payee_id: Some("host_1".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&tx));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = RepositoryError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
