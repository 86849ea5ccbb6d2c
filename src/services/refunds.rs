use bigdecimal::{BigDecimal, Zero};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{to_minor_units, Transaction, TransactionStatus, TransactionType};
use crate::error::PipelineError;
use crate::gateway::CreateRefund;
use crate::ports::{LedgerStore, PaymentGateway, UnitOfWork};
use crate::services::ledger::check_conservation;
use crate::services::lock::{lock_key, LockManager};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundInitiated {
    pub refund_transaction_id: Uuid,
    pub gateway_refund_id: String,
    pub amount: BigDecimal,
}

#[derive(Clone)]
pub struct RefundService {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: LockManager,
}

impl RefundService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: LockManager,
    ) -> Self {
        Self {
            ledger,
            gateway,
            locks,
        }
    }

    pub async fn initiate(
        &self,
        payment_id: Uuid,
        amount: &BigDecimal,
        reason: Option<String>,
    ) -> Result<RefundInitiated, PipelineError> {
        if *amount <= BigDecimal::zero() {
            return Err(PipelineError::Invariant(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }

        let id = payment_id.to_string();
        let key = lock_key("refund", &[&id]);
        self.locks
            .with_lock(&key, || self.initiate_locked(payment_id, amount, reason))
            .await
    }

    async fn initiate_locked(
        &self,
        payment_id: Uuid,
        amount: &BigDecimal,
        reason: Option<String>,
    ) -> Result<RefundInitiated, PipelineError> {
        // Validate before calling out, then again in the writing unit.
        let mut unit = self.ledger.begin().await?;
        let checked = refund_leg(unit.as_mut(), payment_id, amount).await;
        unit.rollback().await?;
        let (payment, _) = checked?;

        let intent_id = payment.payment_intent_id.clone().ok_or_else(|| {
            PipelineError::MissingLinkage(format!("payment {} has no payment intent", payment.id))
        })?;
        let minor = to_minor_units(amount).ok_or_else(|| {
            PipelineError::Invariant(format!("amount {} is not a whole number of minor units", amount))
        })?;

        let refund = self
            .gateway
            .create_refund(&CreateRefund {
                payment_intent: intent_id,
                amount: minor,
                reason,
                idempotency_key: format!("refund-{}-{}", payment.id, Uuid::new_v4()),
            })
            .await?;

        let mut unit = self.ledger.begin().await?;
        let result = async {
            let (_, mut leg) = refund_leg(unit.as_mut(), payment_id, amount).await?;
            leg.external_txn_id = Some(refund.id.clone());
            unit.insert_transaction(&leg).await?;
            Ok::<_, PipelineError>(leg)
        }
        .await;

        match result {
            Ok(leg) => {
                unit.commit().await?;
                tracing::info!(
                    payment_id = %payment_id,
                    refund_id = %refund.id,
                    amount = %amount,
                    "Refund initiated"
                );
                Ok(RefundInitiated {
                    refund_transaction_id: leg.id,
                    gateway_refund_id: refund.id,
                    amount: amount.clone(),
                })
            }
            Err(e) => {
                unit.rollback().await?;
                tracing::error!(
                    payment_id = %payment_id,
                    refund_id = %refund.id,
                    "Gateway refund created but not recorded: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

/// Loads the payment and builds the PENDING refund leg, checking that all
/// of its legs stay within the charged amount.
async fn refund_leg(
    unit: &mut dyn UnitOfWork,
    payment_id: Uuid,
    amount: &BigDecimal,
) -> Result<(Transaction, Transaction), PipelineError> {
    let payment = unit
        .transaction_by_id(payment_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("payment {}", payment_id)))?;

    if payment.transaction_type != TransactionType::BookingPayment {
        return Err(PipelineError::Invariant(format!(
            "transaction {} is a {:?}, not a payment",
            payment.id, payment.transaction_type
        )));
    }
    if !matches!(
        payment.status,
        TransactionStatus::Success | TransactionStatus::PartiallyRefunded
    ) {
        return Err(PipelineError::Invariant(format!(
            "payment {} is {:?} and cannot be refunded",
            payment.id, payment.status
        )));
    }

    let mut leg = Transaction::new(
        TransactionType::BookingRefund,
        amount.clone(),
        payment.currency.clone(),
    );
    leg.parent_transaction_id = Some(payment.id);
    leg.payer_id = payment.payee_id.clone();
    leg.payee_id = payment.payer_id.clone();
    leg.booking_id = payment.booking_id;
    leg.payment_intent_id = payment.payment_intent_id.clone();
    leg.charge_id = payment.charge_id.clone();

    check_conservation(unit, &payment, &leg).await?;
    Ok((payment, leg))
}
