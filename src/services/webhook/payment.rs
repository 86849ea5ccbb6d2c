use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};

use super::HandlerOutcome;
use crate::domain::webhook_event::{CheckoutSessionObject, PaymentIntentObject};
use crate::domain::{
    from_minor_units, Booking, BookingStatus, Transaction, TransactionStatus, TransactionType,
};
use crate::error::PipelineError;
use crate::ports::UnitOfWork;
use crate::services::ledger::check_conservation;
use crate::services::reservation::ReservationCoordinator;

/// Success is sticky. Failure or expiry arriving after a capture is a no-op,
/// while a success arriving after a failure still wins.
pub(super) async fn succeeded(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    intent: &PaymentIntentObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let mut payment = match unit.payment_by_intent(&intent.id).await? {
        Some(payment) => payment,
        None => match payment_from_booking(unit, intent).await? {
            Some(payment) => payment,
            None => {
                return Ok(HandlerOutcome::skipped(format!(
                    "no payment or booking for intent {}",
                    intent.id
                )))
            }
        },
    };

    if payment.status.is_captured() {
        if payment.charge_id.is_none() && intent.latest_charge.is_some() {
            payment.charge_id = intent.latest_charge.clone();
            payment.updated_at = now;
            unit.update_transaction(&payment).await?;
            adopt_orphan_legs(unit, &payment, now).await?;
        }
        return Ok(HandlerOutcome::skipped(format!(
            "payment {} already {:?}",
            payment.id, payment.status
        )));
    }

    let late = matches!(
        payment.status,
        TransactionStatus::Failed | TransactionStatus::Cancelled
    );
    payment.transition(TransactionStatus::Success, now)?;
    if intent.latest_charge.is_some() {
        payment.charge_id = intent.latest_charge.clone();
    }
    payment.markers.correlation.source_event_id = Some(event_id.to_string());
    payment.markers.failure_reason = None;

    let booking = match payment.booking_id {
        Some(booking_id) => unit.booking(booking_id).await?,
        None => None,
    };

    if let Some(mut booking) = booking {
        match booking.status {
            BookingStatus::Pending | BookingStatus::Cancelled | BookingStatus::Expired => {
                if booking.status != BookingStatus::Pending {
                    tracing::info!(
                        booking_id = %booking.id,
                        from = ?booking.status,
                        "Late payment success reopens booking"
                    );
                }
                booking.transition(BookingStatus::Confirmed, now)?;
                unit.update_booking(&booking).await?;
            }
            BookingStatus::Confirmed => {}
            BookingStatus::Refunded => {
                tracing::warn!(booking_id = %booking.id, "Payment succeeded for a refunded booking");
            }
        }
        if late {
            ReservationCoordinator::reinstate(unit, &mut payment, &booking, now).await?;
        }
    }

    unit.update_transaction(&payment).await?;
    adopt_orphan_legs(unit, &payment, now).await?;

    if let Some(fee) = intent.application_fee_amount.filter(|fee| *fee > 0) {
        record_commission(unit, &payment, from_minor_units(fee), now).await?;
    }

    Ok(HandlerOutcome::Applied)
}

pub(super) async fn failed(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    intent: &PaymentIntentObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let reason = intent
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
        .unwrap_or_else(|| "payment failed".to_string());
    close(unit, event_id, &intent.id, TransactionStatus::Failed, reason, now).await
}

pub(super) async fn canceled(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    intent: &PaymentIntentObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let reason = intent
        .cancellation_reason
        .clone()
        .unwrap_or_else(|| "payment canceled".to_string());
    close(unit, event_id, &intent.id, TransactionStatus::Cancelled, reason, now).await
}

async fn close(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    payment_intent_id: &str,
    target: TransactionStatus,
    reason: String,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let Some(mut payment) = unit.payment_by_intent(payment_intent_id).await? else {
        return Ok(HandlerOutcome::skipped(format!(
            "no payment for intent {}",
            payment_intent_id
        )));
    };

    if payment.status.is_captured() {
        tracing::info!(
            payment_id = %payment.id,
            status = ?payment.status,
            "Payment already captured, {:?} ignored",
            target
        );
        return Ok(HandlerOutcome::skipped(format!(
            "payment {} already {:?}",
            payment.id, payment.status
        )));
    }

    if payment.status == TransactionStatus::Pending {
        payment.transition(target, now)?;
        payment.markers.failure_reason = Some(reason);
        payment.markers.correlation.source_event_id = Some(event_id.to_string());
        unit.update_transaction(&payment).await?;
    }

    cancel_booking_and_release(unit, &mut payment, BookingStatus::Cancelled, now).await?;
    Ok(HandlerOutcome::Applied)
}

pub(super) async fn session_expired(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    session: &CheckoutSessionObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    let payment = match (&session.payment_intent, session.metadata.booking_id) {
        (Some(intent_id), _) => unit.payment_by_intent(intent_id).await?,
        (None, Some(booking_id)) => unit.payment_by_booking(booking_id).await?,
        (None, None) => None,
    };
    let Some(mut payment) = payment else {
        return Ok(HandlerOutcome::skipped(format!(
            "no payment for checkout session {}",
            session.id
        )));
    };

    let booking = match payment.booking_id {
        Some(booking_id) => unit.booking(booking_id).await?,
        None => None,
    };
    if let Some(booking) = &booking {
        if booking.status != BookingStatus::Pending {
            tracing::info!(
                booking_id = %booking.id,
                status = ?booking.status,
                "Checkout expired after booking left PENDING, nothing to do"
            );
            return Ok(HandlerOutcome::skipped(format!(
                "booking {} already {:?}",
                booking.id, booking.status
            )));
        }
    }
    if payment.status != TransactionStatus::Pending {
        return Ok(HandlerOutcome::skipped(format!(
            "payment {} already {:?}",
            payment.id, payment.status
        )));
    }

    payment.transition(TransactionStatus::Failed, now)?;
    payment.markers.failure_reason = Some("checkout session expired".to_string());
    payment.markers.correlation.source_event_id = Some(event_id.to_string());
    unit.update_transaction(&payment).await?;

    cancel_booking_and_release(unit, &mut payment, BookingStatus::Expired, now).await?;
    Ok(HandlerOutcome::Applied)
}

async fn cancel_booking_and_release(
    unit: &mut dyn UnitOfWork,
    payment: &mut Transaction,
    booking_status: BookingStatus,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let Some(booking_id) = payment.booking_id else {
        return Ok(());
    };
    let Some(mut booking) = unit.booking(booking_id).await? else {
        tracing::warn!(booking_id = %booking_id, "Payment references a missing booking");
        return Ok(());
    };

    if booking.status == BookingStatus::Pending {
        booking.transition(booking_status, now)?;
        unit.update_booking(&booking).await?;
    }

    if matches!(
        booking.status,
        BookingStatus::Cancelled | BookingStatus::Expired
    ) {
        ReservationCoordinator::release_if_not_already(unit, payment, &booking, now).await?;
    }
    Ok(())
}

/// Records the payment row for an intent the ledger has not seen, using the
/// booking named in the intent metadata.
async fn payment_from_booking(
    unit: &mut dyn UnitOfWork,
    intent: &PaymentIntentObject,
) -> Result<Option<Transaction>, PipelineError> {
    let Some(booking_id) = intent.metadata.booking_id else {
        return Ok(None);
    };
    let Some(booking) = unit.booking(booking_id).await? else {
        return Ok(None);
    };

    let payment = new_payment(&booking, intent);
    unit.insert_transaction(&payment).await?;
    tracing::info!(
        payment_id = %payment.id,
        booking_id = %booking.id,
        intent = %intent.id,
        "Recorded payment first seen in a webhook"
    );
    Ok(Some(payment))
}

fn new_payment(booking: &Booking, intent: &PaymentIntentObject) -> Transaction {
    let mut payment = Transaction::new(
        TransactionType::BookingPayment,
        from_minor_units(intent.amount),
        intent.currency.to_lowercase(),
    );
    payment.payer_id = Some(booking.user_id.clone());
    payment.payee_id = Some(booking.host_id.clone());
    payment.booking_id = Some(booking.id);
    payment.payment_intent_id = Some(intent.id.clone());
    payment
}

async fn record_commission(
    unit: &mut dyn UnitOfWork,
    payment: &Transaction,
    amount: BigDecimal,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let existing = unit
        .children_of(payment.id)
        .await?
        .into_iter()
        .any(|child| child.transaction_type == TransactionType::PlatformCommission);
    if existing || amount.is_zero() {
        return Ok(());
    }

    let mut commission = Transaction::settled(
        TransactionType::PlatformCommission,
        amount,
        payment.currency.clone(),
        now,
    );
    commission.payer_id = payment.payee_id.clone();
    commission.parent_transaction_id = Some(payment.id);
    commission.booking_id = payment.booking_id;
    commission.payment_intent_id = payment.payment_intent_id.clone();
    commission.charge_id = payment.charge_id.clone();

    check_conservation(unit, payment, &commission).await?;
    unit.insert_transaction(&commission).await?;
    Ok(())
}

/// Links split legs that arrived before the payment had a charge. Fee and
/// transfer events may beat the success event, in which case they were
/// recorded without a parent.
async fn adopt_orphan_legs(
    unit: &mut dyn UnitOfWork,
    payment: &Transaction,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let Some(charge_id) = payment.charge_id.as_deref() else {
        return Ok(());
    };

    for leg_type in [TransactionType::PlatformCommission, TransactionType::SellerPayout] {
        let Some(mut leg) = unit.leg_by_charge(leg_type, charge_id).await? else {
            continue;
        };
        if leg.parent_transaction_id.is_some() {
            continue;
        }

        leg.parent_transaction_id = Some(payment.id);
        leg.booking_id = leg.booking_id.or(payment.booking_id);
        if leg.payment_intent_id.is_none() {
            leg.payment_intent_id = payment.payment_intent_id.clone();
        }
        match leg_type {
            TransactionType::PlatformCommission if leg.payer_id.is_none() => {
                leg.payer_id = payment.payee_id.clone();
            }
            TransactionType::SellerPayout if leg.payee_id.is_none() => {
                leg.payee_id = payment.payee_id.clone();
            }
            _ => {}
        }
        leg.updated_at = now;

        check_conservation(unit, payment, &leg).await?;
        unit.update_transaction(&leg).await?;
        tracing::info!(
            leg_id = %leg.id,
            payment_id = %payment.id,
            charge_id = %charge_id,
            "Adopted split leg recorded before its payment"
        );
    }
    Ok(())
}
