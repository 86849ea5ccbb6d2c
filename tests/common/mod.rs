#![allow(dead_code)]

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use payflow_core::adapters::{MemoryJobQueue, MemoryStore};
use payflow_core::domain::{
    Booking, BookingStatus, EventInventory, GatewayEvent, Transaction, TransactionType,
};
use payflow_core::gateway::FakeGateway;
use payflow_core::ports::JobOptions;
use payflow_core::services::LockOptions;
use payflow_core::{AppState, PipelineSettings};

pub struct Harness {
    pub state: AppState,
    pub store: MemoryStore,
    pub queue: Arc<MemoryJobQueue>,
    pub gateway: Arc<FakeGateway>,
}

pub fn harness() -> Harness {
    let gateway = Arc::new(FakeGateway::new());
    let settings = PipelineSettings {
        job_options: JobOptions {
            max_attempts: 3,
            backoff: Duration::ZERO,
        },
        lock_options: LockOptions {
            ttl: Duration::from_secs(5),
            retries: 5,
            retry_delay: Duration::from_millis(20),
        },
        platform_fee_percent: 10,
    };
    let (state, store, queue) = AppState::in_memory(gateway.clone(), settings);
    Harness {
        state,
        store,
        queue,
        gateway,
    }
}

/// A PENDING booking of `quantity` seats whose hold is already taken from
/// an event of capacity 10, plus its PENDING payment of 100.00 on `intent`.
pub struct Checkout {
    pub booking: Booking,
    pub payment: Transaction,
    pub intent: String,
}

pub async fn seed_checkout(store: &MemoryStore, intent: &str, quantity: i32) -> Checkout {
    let now = Utc::now();
    let booking = Booking {
        id: Uuid::new_v4(),
        user_id: "user_1".to_string(),
        host_id: "host_1".to_string(),
        experience_id: Uuid::new_v4(),
        event_id: Uuid::new_v4(),
        quantity,
        total_amount: BigDecimal::from(100),
        currency: "usd".to_string(),
        status: BookingStatus::Pending,
        payment_intent_id: Some(intent.to_string()),
        created_at: now,
        updated_at: now,
    };

    let mut payment = Transaction::new(
        TransactionType::BookingPayment,
        BigDecimal::from(100),
        "usd".to_string(),
    );
    payment.payer_id = Some(booking.user_id.clone());
    payment.payee_id = Some(booking.host_id.clone());
    payment.booking_id = Some(booking.id);
    payment.payment_intent_id = Some(intent.to_string());

    store
        .seed_inventory(EventInventory {
            event_id: booking.event_id,
            capacity: 10,
            available: 10 - quantity,
        })
        .await;
    store.seed_booking(booking.clone()).await;
    store.seed_transaction(payment.clone()).await;

    Checkout {
        booking,
        payment,
        intent: intent.to_string(),
    }
}

pub fn event(id: &str, event_type: &str, payload: Value) -> GatewayEvent {
    GatewayEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        payload,
    }
}

pub fn payment_succeeded(id: &str, checkout: &Checkout, fee: Option<i64>) -> GatewayEvent {
    event(
        id,
        "payment_intent.succeeded",
        json!({
            "id": checkout.intent,
            "amount": 10000,
            "currency": "usd",
            "latest_charge": format!("ch_{}", checkout.intent),
            "application_fee_amount": fee,
            "metadata": { "booking_id": checkout.booking.id },
        }),
    )
}

pub fn payment_failed(id: &str, checkout: &Checkout) -> GatewayEvent {
    event(
        id,
        "payment_intent.payment_failed",
        json!({
            "id": checkout.intent,
            "amount": 10000,
            "currency": "usd",
            "last_payment_error": { "code": "card_declined", "message": "Your card was declined." },
            "metadata": { "booking_id": checkout.booking.id },
        }),
    )
}

pub fn session_expired(id: &str, checkout: &Checkout) -> GatewayEvent {
    event(
        id,
        "checkout.session.expired",
        json!({
            "id": format!("cs_{}", checkout.intent),
            "payment_intent": checkout.intent,
            "metadata": { "booking_id": checkout.booking.id },
        }),
    )
}
