use chrono::{DateTime, Utc};

use super::HandlerOutcome;
use crate::domain::webhook_event::ChargeObject;
use crate::domain::{from_minor_units, BookingStatus, TransactionStatus, TransactionType};
use crate::error::PipelineError;
use crate::ports::UnitOfWork;
use crate::services::ledger::check_conservation;

/// Settles refund legs this system initiated and moves the payment to its
/// refund state. Refunds with no matching leg are logged and left out of
/// the ledger rather than recorded without provenance.
pub(super) async fn charge_refunded(
    unit: &mut dyn UnitOfWork,
    charge: &ChargeObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let mut payment = match unit.payment_by_charge(&charge.id).await? {
        Some(payment) => payment,
        None => match &charge.payment_intent {
            Some(intent_id) => match unit.payment_by_intent(intent_id).await? {
                Some(payment) => payment,
                None => {
                    return Ok(HandlerOutcome::skipped(format!(
                        "no payment for charge {}",
                        charge.id
                    )))
                }
            },
            None => {
                return Ok(HandlerOutcome::skipped(format!(
                    "no payment for charge {}",
                    charge.id
                )))
            }
        },
    };

    if !payment.status.is_captured() {
        return Err(PipelineError::Invariant(format!(
            "refund reported for payment {} in status {:?}",
            payment.id, payment.status
        )));
    }

    let mut settled = 0;
    for refund in &charge.refunds.data {
        let Some(mut leg) = unit.transaction_by_external_id(&refund.id).await? else {
            tracing::warn!(
                refund_id = %refund.id,
                charge_id = %charge.id,
                "Refund was not initiated here, leaving it out of the ledger"
            );
            continue;
        };
        if leg.transaction_type != TransactionType::BookingRefund
            || leg.parent_transaction_id != Some(payment.id)
        {
            tracing::warn!(
                refund_id = %refund.id,
                transaction_id = %leg.id,
                "External id belongs to a different leg"
            );
            continue;
        }
        if leg.status != TransactionStatus::Pending {
            continue;
        }

        let target = match refund.status.as_deref() {
            Some("failed") | Some("canceled") => TransactionStatus::Failed,
            Some("pending") | Some("requires_action") => continue,
            _ => TransactionStatus::Success,
        };

        if target == TransactionStatus::Success {
            leg.amount = from_minor_units(refund.amount);
            check_conservation(unit, &payment, &leg).await?;
        }
        leg.transition(target, now)?;
        leg.charge_id = Some(charge.id.clone());
        unit.update_transaction(&leg).await?;
        settled += 1;
    }

    if settled == 0 {
        return Ok(HandlerOutcome::skipped(format!(
            "no pending refund legs for charge {}",
            charge.id
        )));
    }

    let fully_refunded = charge.amount_refunded >= charge.amount;
    let next = if fully_refunded {
        TransactionStatus::FullyRefunded
    } else {
        TransactionStatus::PartiallyRefunded
    };

    if charge.amount_refunded > 0 && payment.status.can_transition_to(next) {
        payment.transition(next, now)?;
        if payment.charge_id.is_none() {
            payment.charge_id = Some(charge.id.clone());
        }
        unit.update_transaction(&payment).await?;

        if fully_refunded {
            if let Some(booking_id) = payment.booking_id {
                if let Some(mut booking) = unit.booking(booking_id).await? {
                    if booking.status.can_transition_to(BookingStatus::Refunded) {
                        booking.transition(BookingStatus::Refunded, now)?;
                        unit.update_booking(&booking).await?;
                    }
                }
            }
        }
    }

    Ok(HandlerOutcome::Applied)
}
