//! Applies gateway events to the ledger.
//!
//! Each event is handled inside one serializable unit of work that also
//! flips the event row to PROCESSED, so a redelivery either finds nothing
//! done yet or everything done.

mod payment;
mod payout;
mod refund;

use chrono::Utc;
use std::sync::Arc;

use crate::domain::{GatewayEvent, GatewayEventKind, WebhookEventStatus};
use crate::error::PipelineError;
use crate::ports::{EventStore, LedgerStore, PaymentGateway, UnitOfWork};
use crate::services::lock::{lock_key, LockManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Ledger and booking state changed.
    Applied,
    /// The event id was already processed.
    Duplicate,
    /// Nothing to change: correlation unresolvable or state already further along.
    Skipped(String),
    /// Event type this pipeline does not act on.
    Ignored,
}

impl HandlerOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        HandlerOutcome::Skipped(reason.into())
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    ledger: Arc<dyn LedgerStore>,
    events: Arc<dyn EventStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: LockManager,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        events: Arc<dyn EventStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: LockManager,
    ) -> Self {
        Self {
            ledger,
            events,
            gateway,
            locks,
        }
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Handles one delivery. Errors are classified by `is_retryable`.
    pub async fn process(&self, event: &GatewayEvent) -> Result<HandlerOutcome, PipelineError> {
        let key = lock_key("webhook", &[&event.id]);
        self.locks
            .with_lock(&key, || self.process_exclusive(event))
            .await
    }

    async fn process_exclusive(
        &self,
        event: &GatewayEvent,
    ) -> Result<HandlerOutcome, PipelineError> {
        let recorded = self.events.record_if_new(event).await?;
        if recorded.status == WebhookEventStatus::Processed {
            tracing::debug!(event_id = %event.id, "Event already processed");
            return Ok(HandlerOutcome::Duplicate);
        }

        let mut kind = event.kind()?;

        // The charge id is needed to correlate later fee, transfer and
        // refund events; fetch it before any rows are locked.
        if let GatewayEventKind::PaymentSucceeded(intent) = &mut kind {
            if intent.latest_charge.is_none() {
                let fetched = self.gateway.retrieve_payment_intent(&intent.id).await?;
                intent.latest_charge = fetched.latest_charge;
            }
        }

        let mut unit = self.ledger.begin().await?;
        match apply(unit.as_mut(), &event.id, kind).await {
            Ok(HandlerOutcome::Duplicate) => {
                unit.rollback().await?;
                tracing::debug!(event_id = %event.id, "Event claimed by a concurrent delivery");
                Ok(HandlerOutcome::Duplicate)
            }
            Ok(outcome) => {
                unit.commit().await?;
                match &outcome {
                    HandlerOutcome::Skipped(reason) => {
                        tracing::warn!(event_id = %event.id, event_type = %event.event_type, reason = %reason, "Event skipped")
                    }
                    HandlerOutcome::Ignored => {
                        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Event type ignored")
                    }
                    _ => {
                        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Event applied")
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::error!(event_id = %event.id, "Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

async fn apply(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    kind: GatewayEventKind,
) -> Result<HandlerOutcome, PipelineError> {
    if !unit.claim_event(event_id).await? {
        return Ok(HandlerOutcome::Duplicate);
    }

    let now = Utc::now();
    match kind {
        GatewayEventKind::PaymentSucceeded(intent) => {
            payment::succeeded(unit, event_id, &intent, now).await
        }
        GatewayEventKind::PaymentFailed(intent) => payment::failed(unit, event_id, &intent, now).await,
        GatewayEventKind::PaymentCanceled(intent) => {
            payment::canceled(unit, event_id, &intent, now).await
        }
        GatewayEventKind::CheckoutSessionExpired(session) => {
            payment::session_expired(unit, event_id, &session, now).await
        }
        GatewayEventKind::ChargeRefunded(charge) => refund::charge_refunded(unit, &charge, now).await,
        GatewayEventKind::TransferCreated(transfer) => {
            payout::transfer_created(unit, event_id, &transfer, now).await
        }
        GatewayEventKind::ApplicationFeeCreated(fee) => {
            payout::application_fee_created(unit, event_id, &fee, now).await
        }
        GatewayEventKind::Unknown(_) => Ok(HandlerOutcome::Ignored),
    }
}
