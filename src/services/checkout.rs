use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{to_minor_units, Booking, BookingStatus, Transaction, TransactionType};
use crate::error::PipelineError;
use crate::gateway::CreatePaymentIntent;
use crate::ports::{LedgerStore, PaymentGateway, UnitOfWork};
use crate::services::lock::{lock_key, LockManager};
use crate::services::reservation::ReservationCoordinator;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub host_id: String,
    /// The host's connected account; checkout is refused without one.
    pub host_connected_account: Option<String>,
    pub experience_id: Uuid,
    pub event_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSession {
    pub booking_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    /// True when an earlier PENDING booking was handed back.
    pub reused: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: LockManager,
    platform_fee_percent: u32,
}

impl CheckoutService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: LockManager,
        platform_fee_percent: u32,
    ) -> Self {
        Self {
            ledger,
            gateway,
            locks,
            platform_fee_percent,
        }
    }

    /// Serialized per (experience, event, user) so a double click cannot
    /// create two intents or hold seats twice.
    pub async fn start_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PipelineError> {
        if request.quantity <= 0 {
            return Err(PipelineError::Invariant(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }

        let experience = request.experience_id.to_string();
        let event = request.event_id.to_string();
        let key = lock_key("payment", &[&experience, &event, &request.user_id]);

        self.locks
            .with_lock(&key, || self.start_checkout_locked(request))
            .await
    }

    async fn start_checkout_locked(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PipelineError> {
        if let Some(session) = self.existing_session(request).await? {
            return Ok(session);
        }

        let destination = request.host_connected_account.clone().ok_or_else(|| {
            PipelineError::MissingLinkage(format!(
                "host {} has no connected account",
                request.host_id
            ))
        })?;

        let total = &request.unit_price * BigDecimal::from(request.quantity);
        let amount = to_minor_units(&total).ok_or_else(|| {
            PipelineError::Invariant(format!("amount {} is not a whole number of minor units", total))
        })?;
        let fee = amount * i64::from(self.platform_fee_percent) / 100;
        let booking_id = Uuid::new_v4();

        let intent = self
            .gateway
            .create_payment_intent(&CreatePaymentIntent {
                amount,
                currency: request.currency.to_lowercase(),
                application_fee_amount: (fee > 0).then_some(fee),
                destination: Some(destination),
                booking_id,
                idempotency_key: format!("checkout-{}", booking_id),
            })
            .await?;

        let mut unit = self.ledger.begin().await?;
        match record_booking(unit.as_mut(), request, booking_id, total, &intent.id).await {
            Ok(payment_id) => {
                unit.commit().await?;
                tracing::info!(
                    booking_id = %booking_id,
                    payment_intent = %intent.id,
                    quantity = request.quantity,
                    "Checkout started"
                );
                Ok(CheckoutSession {
                    booking_id,
                    payment_id: Some(payment_id),
                    payment_intent_id: intent.id,
                    client_secret: intent.client_secret,
                    reused: false,
                })
            }
            Err(e) => {
                if let Err(rollback) = unit.rollback().await {
                    tracing::error!("Checkout rollback failed: {}", rollback);
                }
                if let Err(cancel) = self.gateway.cancel_payment_intent(&intent.id).await {
                    tracing::error!(
                        payment_intent = %intent.id,
                        "Failed to cancel orphaned payment intent: {}",
                        cancel
                    );
                }
                Err(e)
            }
        }
    }

    async fn existing_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<Option<CheckoutSession>, PipelineError> {
        let mut unit = self.ledger.begin().await?;
        let booking = unit
            .pending_booking_for(&request.user_id, request.experience_id, request.event_id)
            .await?;
        let session = match booking {
            Some(booking) => match booking.payment_intent_id.clone() {
                Some(intent_id) => {
                    let payment = unit.payment_by_booking(booking.id).await?;
                    Some(CheckoutSession {
                        booking_id: booking.id,
                        payment_id: payment.map(|p| p.id),
                        payment_intent_id: intent_id,
                        client_secret: None,
                        reused: true,
                    })
                }
                None => None,
            },
            None => None,
        };
        unit.rollback().await?;

        if let Some(session) = &session {
            tracing::debug!(booking_id = %session.booking_id, "Reusing pending checkout");
        }
        Ok(session)
    }
}

async fn record_booking(
    unit: &mut dyn UnitOfWork,
    request: &CheckoutRequest,
    booking_id: Uuid,
    total: BigDecimal,
    intent_id: &str,
) -> Result<Uuid, PipelineError> {
    ReservationCoordinator::hold(unit, request.event_id, request.quantity).await?;

    let now = Utc::now();
    let currency = request.currency.to_lowercase();
    let booking = Booking {
        id: booking_id,
        user_id: request.user_id.clone(),
        host_id: request.host_id.clone(),
        experience_id: request.experience_id,
        event_id: request.event_id,
        quantity: request.quantity,
        total_amount: total.clone(),
        currency: currency.clone(),
        status: BookingStatus::Pending,
        payment_intent_id: Some(intent_id.to_string()),
        created_at: now,
        updated_at: now,
    };
    unit.insert_booking(&booking).await?;

    let mut payment = Transaction::new(TransactionType::BookingPayment, total, currency);
    payment.payer_id = Some(request.user_id.clone());
    payment.payee_id = Some(request.host_id.clone());
    payment.booking_id = Some(booking_id);
    payment.payment_intent_id = Some(intent_id.to_string());
    unit.insert_transaction(&payment).await?;
    Ok(payment.id)
}
