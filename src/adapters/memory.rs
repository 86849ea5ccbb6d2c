//! In-memory ledger and event store.
//!
//! A unit of work holds the store mutex for its whole lifetime and edits a
//! private copy of the state, so units run strictly one after another and
//! a rollback simply drops the copy.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    BatchKind, BatchStatus, Booking, BookingStatus, EarnBatch, EventInventory, GatewayEvent,
    Transaction, TransactionType, WebhookEvent, WebhookEventStatus, WithdrawalRequest,
};
use crate::ports::{
    EventStore, LedgerStore, PageRequest, RecordOutcome, RepositoryError, RepositoryResult,
    TransactionFilter, TransactionGraph, UnitOfWork,
};

#[derive(Debug, Clone, Default)]
struct State {
    transactions: HashMap<Uuid, Transaction>,
    bookings: HashMap<Uuid, Booking>,
    inventory: HashMap<Uuid, EventInventory>,
    batches: HashMap<Uuid, EarnBatch>,
    balances: HashMap<(BatchKind, String), BigDecimal>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
    events: HashMap<String, WebhookEvent>,
}

impl State {
    fn find_transaction(&self, pred: impl Fn(&Transaction) -> bool) -> Option<Transaction> {
        self.transactions
            .values()
            .filter(|tx| pred(tx))
            .min_by_key(|tx| (tx.created_at, tx.id))
            .cloned()
    }

    fn children_of(&self, parent_id: Uuid) -> Vec<Transaction> {
        let mut children: Vec<Transaction> = self
            .transactions
            .values()
            .filter(|tx| tx.parent_transaction_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|tx| (tx.created_at, tx.id));
        children
    }

    fn check_external_id(&self, tx: &Transaction) -> RepositoryResult<()> {
        if let Some(external) = &tx.external_txn_id {
            let clash = self
                .transactions
                .values()
                .any(|other| other.id != tx.id && other.external_txn_id.as_ref() == Some(external));
            if clash {
                return Err(RepositoryError::Duplicate(format!(
                    "external_txn_id {} already recorded",
                    external
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_transaction(&self, tx: Transaction) {
        self.state.lock().await.transactions.insert(tx.id, tx);
    }

    pub async fn seed_booking(&self, booking: Booking) {
        self.state.lock().await.bookings.insert(booking.id, booking);
    }

    pub async fn seed_inventory(&self, inventory: EventInventory) {
        self.state
            .lock()
            .await
            .inventory
            .insert(inventory.event_id, inventory);
    }

    pub async fn seed_withdrawal(&self, request: WithdrawalRequest) {
        self.state
            .lock()
            .await
            .withdrawals
            .insert(request.id, request);
    }

    pub async fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.state.lock().await.transactions.get(&id).cloned()
    }

    pub async fn transactions_of_type(&self, transaction_type: TransactionType) -> Vec<Transaction> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.transaction_type == transaction_type)
            .cloned()
            .collect();
        rows.sort_by_key(|tx| (tx.created_at, tx.id));
        rows
    }

    pub async fn booking(&self, id: Uuid) -> Option<Booking> {
        self.state.lock().await.bookings.get(&id).cloned()
    }

    pub async fn inventory(&self, event_id: Uuid) -> Option<EventInventory> {
        self.state.lock().await.inventory.get(&event_id).cloned()
    }

    pub async fn batch(&self, id: Uuid) -> Option<EarnBatch> {
        self.state.lock().await.batches.get(&id).cloned()
    }

    pub async fn withdrawal(&self, id: Uuid) -> Option<WithdrawalRequest> {
        self.state.lock().await.withdrawals.get(&id).cloned()
    }
}

pub struct MemoryUnit {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn claim_event(&mut self, event_id: &str) -> RepositoryResult<bool> {
        let event = self
            .working
            .events
            .get_mut(event_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook event {}", event_id)))?;
        if event.status == WebhookEventStatus::Processed {
            return Ok(false);
        }
        event.status = WebhookEventStatus::Processed;
        event.error = None;
        event.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn transaction_by_id(&mut self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        Ok(self.working.transactions.get(&id).cloned())
    }

    async fn payment_by_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        Ok(self.working.find_transaction(|tx| {
            tx.transaction_type == TransactionType::BookingPayment
                && tx.payment_intent_id.as_deref() == Some(payment_intent_id)
        }))
    }

    async fn payment_by_charge(&mut self, charge_id: &str) -> RepositoryResult<Option<Transaction>> {
        Ok(self.working.find_transaction(|tx| {
            tx.transaction_type == TransactionType::BookingPayment
                && tx.charge_id.as_deref() == Some(charge_id)
        }))
    }

    async fn payment_by_booking(
        &mut self,
        booking_id: Uuid,
    ) -> RepositoryResult<Option<Transaction>> {
        Ok(self.working.find_transaction(|tx| {
            tx.transaction_type == TransactionType::BookingPayment
                && tx.booking_id == Some(booking_id)
        }))
    }

    async fn transaction_by_external_id(
        &mut self,
        external_txn_id: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .working
            .find_transaction(|tx| tx.external_txn_id.as_deref() == Some(external_txn_id)))
    }

    async fn leg_by_charge(
        &mut self,
        transaction_type: TransactionType,
        charge_id: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        Ok(self.working.find_transaction(|tx| {
            tx.transaction_type == transaction_type && tx.charge_id.as_deref() == Some(charge_id)
        }))
    }

    async fn children_of(&mut self, parent_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        Ok(self.working.children_of(parent_id))
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> RepositoryResult<()> {
        if self.working.transactions.contains_key(&tx.id) {
            return Err(RepositoryError::Duplicate(format!("transaction {}", tx.id)));
        }
        self.working.check_external_id(tx)?;
        self.working.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> RepositoryResult<()> {
        if !self.working.transactions.contains_key(&tx.id) {
            return Err(RepositoryError::NotFound(format!("transaction {}", tx.id)));
        }
        self.working.check_external_id(tx)?;
        self.working.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn booking(&mut self, id: Uuid) -> RepositoryResult<Option<Booking>> {
        Ok(self.working.bookings.get(&id).cloned())
    }

    async fn pending_booking_for(
        &mut self,
        user_id: &str,
        experience_id: Uuid,
        event_id: Uuid,
    ) -> RepositoryResult<Option<Booking>> {
        Ok(self
            .working
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::Pending
                    && b.user_id == user_id
                    && b.experience_id == experience_id
                    && b.event_id == event_id
            })
            .min_by_key(|b| (b.created_at, b.id))
            .cloned())
    }

    async fn insert_booking(&mut self, booking: &Booking) -> RepositoryResult<()> {
        if self.working.bookings.contains_key(&booking.id) {
            return Err(RepositoryError::Duplicate(format!("booking {}", booking.id)));
        }
        self.working.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn update_booking(&mut self, booking: &Booking) -> RepositoryResult<()> {
        if !self.working.bookings.contains_key(&booking.id) {
            return Err(RepositoryError::NotFound(format!("booking {}", booking.id)));
        }
        self.working.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn inventory(&mut self, event_id: Uuid) -> RepositoryResult<Option<EventInventory>> {
        Ok(self.working.inventory.get(&event_id).cloned())
    }

    async fn save_inventory(&mut self, inventory: &EventInventory) -> RepositoryResult<()> {
        self.working
            .inventory
            .insert(inventory.event_id, inventory.clone());
        Ok(())
    }

    async fn active_batches(
        &mut self,
        kind: BatchKind,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<EarnBatch>> {
        let mut batches: Vec<EarnBatch> = self
            .working
            .batches
            .values()
            .filter(|b| {
                b.kind == kind
                    && b.subject_id == subject_id
                    && b.status == BatchStatus::Active
                    && !b.is_expired_at(now)
            })
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.earned_at, b.id));
        Ok(batches)
    }

    async fn expired_batches(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<EarnBatch>> {
        let mut batches: Vec<EarnBatch> = self
            .working
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Active && b.is_expired_at(now))
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.expires_at, b.id));
        batches.truncate(limit.max(0) as usize);
        Ok(batches)
    }

    async fn insert_batch(&mut self, batch: &EarnBatch) -> RepositoryResult<()> {
        if self.working.batches.contains_key(&batch.id) {
            return Err(RepositoryError::Duplicate(format!("batch {}", batch.id)));
        }
        self.working.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn save_batch(&mut self, batch: &EarnBatch) -> RepositoryResult<()> {
        self.working.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn adjust_balance(
        &mut self,
        kind: BatchKind,
        subject_id: &str,
        delta: &BigDecimal,
    ) -> RepositoryResult<BigDecimal> {
        let balance = self
            .working
            .balances
            .entry((kind, subject_id.to_string()))
            .or_insert_with(|| BigDecimal::from(0));
        *balance = &*balance + delta;
        Ok(balance.clone())
    }

    async fn withdrawal_request(
        &mut self,
        id: Uuid,
    ) -> RepositoryResult<Option<WithdrawalRequest>> {
        Ok(self.working.withdrawals.get(&id).cloned())
    }

    async fn save_withdrawal_request(
        &mut self,
        request: &WithdrawalRequest,
    ) -> RepositoryResult<()> {
        self.working.withdrawals.insert(request.id, request.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepositoryResult<()> {
        let MemoryUnit { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepositoryResult<()> {
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnit { guard, working }))
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        page: &PageRequest,
    ) -> RepositoryResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| filter.matches(tx))
            .filter(|tx| page.after.map_or(true, |after| (tx.created_at, tx.id) < after))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(page.limit.max(0) as usize);
        Ok(rows)
    }

    async fn transaction_graph(&self, id: Uuid) -> RepositoryResult<Option<TransactionGraph>> {
        let state = self.state.lock().await;
        let Some(transaction) = state.transactions.get(&id).cloned() else {
            return Ok(None);
        };
        let parent = transaction
            .parent_transaction_id
            .and_then(|parent_id| state.transactions.get(&parent_id).cloned());
        let children = state.children_of(id);
        let booking = transaction
            .booking_id
            .and_then(|booking_id| state.bookings.get(&booking_id).cloned());

        Ok(Some(TransactionGraph {
            transaction,
            parent,
            children,
            booking,
        }))
    }

    async fn booking_status(&self, id: Uuid) -> RepositoryResult<Option<BookingStatus>> {
        Ok(self.state.lock().await.bookings.get(&id).map(|b| b.status))
    }

    async fn balance(&self, kind: BatchKind, subject_id: &str) -> RepositoryResult<BigDecimal> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&(kind, subject_id.to_string()))
            .cloned()
            .unwrap_or_else(|| BigDecimal::from(0)))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record_if_new(&self, event: &GatewayEvent) -> RepositoryResult<RecordOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.events.get(&event.id) {
            return Ok(RecordOutcome {
                is_new: false,
                status: existing.status,
            });
        }
        state
            .events
            .insert(event.id.clone(), WebhookEvent::from_gateway(event));
        Ok(RecordOutcome {
            is_new: true,
            status: WebhookEventStatus::Pending,
        })
    }

    async fn get(&self, event_id: &str) -> RepositoryResult<Option<WebhookEvent>> {
        Ok(self.state.lock().await.events.get(event_id).cloned())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook event {}", event_id)))?;
        if event.status != WebhookEventStatus::Processed {
            event.status = WebhookEventStatus::Failed;
            event.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn reset_for_replay(&self, event_id: &str) -> RepositoryResult<WebhookEvent> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook event {}", event_id)))?;
        if event.status != WebhookEventStatus::Failed {
            return Err(RepositoryError::Conflict(format!(
                "webhook event {} is {:?}, only failed events can be replayed",
                event_id, event.status
            )));
        }
        event.status = WebhookEventStatus::Pending;
        event.error = None;
        Ok(event.clone())
    }

    async fn list_by_status(
        &self,
        status: WebhookEventStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}
