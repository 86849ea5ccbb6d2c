pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ports;
pub mod services;
pub mod startup;
pub mod utils;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::adapters::{MemoryJobQueue, MemoryLockStore, MemoryStore};
use crate::ports::{EventStore, JobOptions, JobQueue, LedgerStore, LockStore, PaymentGateway};
use crate::services::{
    CheckoutService, EventIntake, LedgerService, LockManager, LockOptions, RefundService,
    RewardService, WebhookProcessor, WithdrawalService, WorkerPool, WorkerSettings,
};

/// The stores and clients a running pipeline is assembled from.
#[derive(Clone)]
pub struct Components {
    pub ledger: Arc<dyn LedgerStore>,
    pub events: Arc<dyn EventStore>,
    pub queue: Arc<dyn JobQueue>,
    pub locks: Arc<dyn LockStore>,
    pub gateway: Arc<dyn PaymentGateway>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub job_options: JobOptions,
    pub lock_options: LockOptions,
    pub platform_fee_percent: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            job_options: JobOptions::default(),
            lock_options: LockOptions::default(),
            platform_fee_percent: 10,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerService,
    pub events: Arc<dyn EventStore>,
    pub queue: Arc<dyn JobQueue>,
    pub intake: EventIntake,
    pub processor: WebhookProcessor,
    pub checkout: CheckoutService,
    pub refunds: RefundService,
    pub rewards: RewardService,
    pub withdrawals: WithdrawalService,
}

impl AppState {
    pub fn build(components: Components, settings: PipelineSettings) -> Self {
        let locks = LockManager::new(components.locks, settings.lock_options);
        let Components {
            ledger,
            events,
            queue,
            gateway,
            ..
        } = components;

        AppState {
            ledger: LedgerService::new(ledger.clone()),
            intake: EventIntake::new(events.clone(), queue.clone(), settings.job_options),
            processor: WebhookProcessor::new(
                ledger.clone(),
                events.clone(),
                gateway.clone(),
                locks.clone(),
            ),
            checkout: CheckoutService::new(
                ledger.clone(),
                gateway.clone(),
                locks.clone(),
                settings.platform_fee_percent,
            ),
            refunds: RefundService::new(ledger.clone(), gateway.clone(), locks.clone()),
            rewards: RewardService::new(ledger.clone(), locks.clone()),
            withdrawals: WithdrawalService::new(ledger, gateway, locks),
            events,
            queue,
        }
    }

    /// Fully in-process pipeline for tests and local experiments. The
    /// returned handles expose the stores for seeding and inspection.
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        settings: PipelineSettings,
    ) -> (Self, MemoryStore, Arc<MemoryJobQueue>) {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryJobQueue::new());
        let state = Self::build(
            Components {
                ledger: Arc::new(store.clone()),
                events: Arc::new(store.clone()),
                queue: queue.clone(),
                locks: Arc::new(MemoryLockStore::new()),
                gateway,
            },
            settings,
        );
        (state, store, queue)
    }

    pub fn worker_pool(&self, settings: WorkerSettings) -> WorkerPool {
        WorkerPool::new(self.processor.clone(), self.queue.clone(), settings)
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/internal/events", post(handlers::events::accept_event))
        .route("/transactions", get(handlers::transactions::list_transactions))
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route("/checkout", post(handlers::payments::start_checkout))
        .route("/payments/:id/refunds", post(handlers::payments::initiate_refund))
        .route("/rewards/points/:user_id/redeem", post(handlers::payments::redeem_points))
        .route("/rewards/coupons/:code/redeem", post(handlers::payments::redeem_coupon))
        .route("/admin/webhook-events", get(handlers::admin::list_webhook_events))
        .route(
            "/admin/webhook-events/:event_id/replay",
            post(handlers::admin::replay_webhook_event),
        )
        .route("/admin/dead-letters", get(handlers::admin::list_dead_letters))
        .route(
            "/admin/withdrawals/:id/approve",
            post(handlers::admin::approve_withdrawal),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
