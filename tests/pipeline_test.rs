mod common;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use common::{event, harness, payment_succeeded, seed_checkout};
use payflow_core::adapters::{MemoryJobQueue, MemoryLockStore, MemoryStore};
use payflow_core::domain::{BatchKind, BookingStatus, TransactionStatus, WebhookEventStatus};
use payflow_core::gateway::FakeGateway;
use payflow_core::ports::{
    EventStore, JobOptions, JobQueue, LedgerStore, Page, PageRequest, RepositoryError,
    RepositoryResult, TransactionFilter, TransactionGraph, UnitOfWork,
};
use payflow_core::services::{HandlerOutcome, IntakeOutcome, JobResult, WorkerSettings};
use payflow_core::{AppState, Components, PipelineSettings};

#[tokio::test]
async fn test_accepted_event_is_processed_by_a_worker() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_1", 2).await;
    let delivery = payment_succeeded("evt_1", &checkout, None);

    assert_eq!(h.state.intake.accept(&delivery).await.unwrap(), IntakeOutcome::Enqueued);
    assert_eq!(h.state.intake.accept(&delivery).await.unwrap(), IntakeOutcome::AlreadyQueued);

    let pool = h.state.worker_pool(WorkerSettings::default());
    let results = pool.drain().await.unwrap();
    assert_eq!(results, vec![JobResult::Completed(HandlerOutcome::Applied)]);

    assert_eq!(
        h.store.booking(checkout.booking.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
    assert_eq!(h.state.intake.accept(&delivery).await.unwrap(), IntakeOutcome::Duplicate);
    assert_eq!(h.queue.outstanding(), 0);
}

#[tokio::test]
async fn test_transient_gateway_error_is_retried() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_2", 1).await;
    let delivery = event(
        "evt_needs_charge",
        "payment_intent.succeeded",
        json!({
            "id": "pi_2",
            "amount": 10000,
            "currency": "usd",
            "metadata": { "booking_id": checkout.booking.id },
        }),
    );
    h.gateway.fail_next(503, "gateway unavailable");
    h.state.intake.accept(&delivery).await.unwrap();

    let results = h.state.worker_pool(WorkerSettings::default()).drain().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], JobResult::Retrying { attempt: 1, .. }));
    assert_eq!(results[1], JobResult::Completed(HandlerOutcome::Applied));

    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Success);
}

#[tokio::test]
async fn test_business_failure_is_recorded_and_replayable() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_3", 1).await;

    // A refund reported before the capture was seen cannot be applied.
    let early_refund = event(
        "evt_early_refund",
        "charge.refunded",
        json!({
            "id": "ch_pi_3",
            "payment_intent": "pi_3",
            "amount": 10000,
            "amount_refunded": 10000,
            "currency": "usd",
        }),
    );
    h.state.intake.accept(&early_refund).await.unwrap();
    let pool = h.state.worker_pool(WorkerSettings::default());
    let results = pool.drain().await.unwrap();
    assert!(matches!(results[..], [JobResult::Rejected(_)]));

    let stored = h.store.get("evt_early_refund").await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Failed);
    assert!(stored.error.unwrap().contains("Invariant"));

    h.state
        .intake
        .accept(&payment_succeeded("evt_capture", &checkout, None))
        .await
        .unwrap();
    pool.drain().await.unwrap();

    assert_eq!(
        h.state.intake.replay("evt_early_refund").await.unwrap(),
        IntakeOutcome::Enqueued
    );
    let results = pool.drain().await.unwrap();
    assert!(matches!(
        results[..],
        [JobResult::Completed(HandlerOutcome::Skipped(_))]
    ));
    let stored = h.store.get("evt_early_refund").await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Processed);

    assert!(matches!(
        h.state.intake.replay("evt_early_refund").await,
        Err(RepositoryError::Conflict(_))
    ));
}

/// A ledger whose database is down.
struct UnreachableLedger;

#[async_trait]
impl LedgerStore for UnreachableLedger {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        Err(RepositoryError::Unavailable("connection refused".to_string()))
    }

    async fn list_transactions(
        &self,
        _filter: &TransactionFilter,
        _page: &PageRequest,
    ) -> RepositoryResult<Vec<payflow_core::domain::Transaction>> {
        Err(RepositoryError::Unavailable("connection refused".to_string()))
    }

    async fn transaction_graph(&self, _id: Uuid) -> RepositoryResult<Option<TransactionGraph>> {
        Err(RepositoryError::Unavailable("connection refused".to_string()))
    }

    async fn booking_status(
        &self,
        _id: Uuid,
    ) -> RepositoryResult<Option<payflow_core::domain::BookingStatus>> {
        Err(RepositoryError::Unavailable("connection refused".to_string()))
    }

    async fn balance(&self, _kind: BatchKind, _subject_id: &str) -> RepositoryResult<BigDecimal> {
        Err(RepositoryError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_the_event() {
    let events = MemoryStore::new();
    let queue = Arc::new(MemoryJobQueue::new());
    let settings = PipelineSettings {
        job_options: JobOptions {
            max_attempts: 3,
            backoff: std::time::Duration::ZERO,
        },
        ..PipelineSettings::default()
    };
    let state = AppState::build(
        Components {
            ledger: Arc::new(UnreachableLedger),
            events: Arc::new(events.clone()),
            queue: queue.clone(),
            locks: Arc::new(MemoryLockStore::new()),
            gateway: Arc::new(FakeGateway::new()),
        },
        settings,
    );

    let delivery = event(
        "evt_doomed",
        "payment_intent.succeeded",
        json!({ "id": "pi_x", "amount": 100, "currency": "usd", "latest_charge": "ch_x" }),
    );
    state.intake.accept(&delivery).await.unwrap();

    let results = state.worker_pool(WorkerSettings::default()).drain().await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], JobResult::Retrying { attempt: 1, .. }));
    assert!(matches!(results[1], JobResult::Retrying { attempt: 2, .. }));
    assert_eq!(results[2], JobResult::DeadLettered { attempts: 3 });

    let stored = events.get("evt_doomed").await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Failed);

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.id, "evt_doomed");
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test]
async fn test_spawned_workers_stop_on_shutdown() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_4", 1).await;
    h.state
        .intake
        .accept(&payment_succeeded("evt_bg", &checkout, None))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let settings = WorkerSettings {
        concurrency: 2,
        poll_interval: std::time::Duration::from_millis(10),
        ..WorkerSettings::default()
    };
    let handles = h.state.worker_pool(settings).spawn(shutdown_rx);

    let mut confirmed = false;
    for _ in 0..100 {
        if h.store.booking(checkout.booking.id).await.unwrap().status == BookingStatus::Confirmed {
            confirmed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(confirmed);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_ledger_listing_pages_newest_first() {
    let h = harness();
    for intent in ["pi_a", "pi_b", "pi_c"] {
        seed_checkout(&h.store, intent, 1).await;
    }

    let filter = TransactionFilter {
        payer_id: Some("user_1".to_string()),
        ..TransactionFilter::default()
    };
    let first: Page<_> = h.state.ledger.list(&filter, Some(2), None).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let cursor = first.next_cursor.clone().unwrap();

    let second = h.state.ledger.list(&filter, Some(2), Some(&cursor)).await.unwrap();
    assert_eq!(second.items.len(), 1);
    assert!(second.next_cursor.is_none());
    assert!(first.items[1].created_at >= second.items[0].created_at);
}

#[tokio::test]
async fn test_graph_links_parent_children_and_booking() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_g", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_g", &checkout, Some(500)))
        .await
        .unwrap();

    let graph = h.state.ledger.graph(checkout.payment.id).await.unwrap();
    assert_eq!(graph.children.len(), 1);
    assert!(graph.parent.is_none());
    assert_eq!(graph.booking.unwrap().id, checkout.booking.id);

    let child = graph.children[0].id;
    let child_graph = h.state.ledger.graph(child).await.unwrap();
    assert_eq!(child_graph.parent.unwrap().id, checkout.payment.id);
}
