use chrono::{DateTime, Utc};

use super::HandlerOutcome;
use crate::domain::webhook_event::{ApplicationFeeObject, TransferObject};
use crate::domain::{from_minor_units, Transaction, TransactionStatus, TransactionType};
use crate::error::PipelineError;
use crate::ports::UnitOfWork;
use crate::services::ledger::check_conservation;

pub(super) async fn transfer_created(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    transfer: &TransferObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    if let Some(existing) = unit.transaction_by_external_id(&transfer.id).await? {
        return Ok(HandlerOutcome::skipped(format!(
            "transfer {} already recorded as {}",
            transfer.id, existing.id
        )));
    }

    let parent = match (&transfer.source_transaction, transfer.metadata.booking_id) {
        (Some(charge_id), _) => unit.payment_by_charge(charge_id).await?,
        (None, Some(booking_id)) => unit.payment_by_booking(booking_id).await?,
        (None, None) => None,
    };

    let backfill = match &transfer.source_transaction {
        Some(charge_id) => unit.leg_by_charge(TransactionType::SellerPayout, charge_id).await?,
        None => None,
    };

    let amount = from_minor_units(transfer.amount);
    let (mut leg, is_new) = match backfill {
        Some(mut leg) if leg.transfer_id.is_none() => {
            leg.amount = amount;
            leg.transfer_id = Some(transfer.id.clone());
            leg.external_txn_id = Some(transfer.id.clone());
            if leg.status == TransactionStatus::Pending {
                leg.transition(TransactionStatus::Success, now)?;
            }
            leg.updated_at = now;
            (leg, false)
        }
        // No leg, or the charge's payout already carries another transfer.
        _ => {
            let mut leg = Transaction::settled(
                TransactionType::SellerPayout,
                amount,
                transfer.currency.to_lowercase(),
                now,
            );
            leg.transfer_id = Some(transfer.id.clone());
            leg.external_txn_id = Some(transfer.id.clone());
            leg.charge_id = transfer.source_transaction.clone();
            if let Some(parent) = &parent {
                leg.parent_transaction_id = Some(parent.id);
                leg.booking_id = parent.booking_id;
                leg.payment_intent_id = parent.payment_intent_id.clone();
                leg.payee_id = parent.payee_id.clone();
            }
            (leg, true)
        }
    };

    leg.markers.correlation.source_event_id = Some(event_id.to_string());
    leg.markers.correlation.connected_account = transfer.destination.clone();

    if let Some(parent) = &parent {
        check_conservation(unit, parent, &leg).await?;
    } else {
        tracing::warn!(
            transfer_id = %transfer.id,
            "Transfer has no resolvable originating payment, recording without parent"
        );
    }

    if is_new {
        unit.insert_transaction(&leg).await?;
    } else {
        unit.update_transaction(&leg).await?;
    }
    Ok(HandlerOutcome::Applied)
}

pub(super) async fn application_fee_created(
    unit: &mut dyn UnitOfWork,
    event_id: &str,
    fee: &ApplicationFeeObject,
    now: DateTime<Utc>,
) -> Result<HandlerOutcome, PipelineError> {
    if let Some(existing) = unit.transaction_by_external_id(&fee.id).await? {
        return Ok(HandlerOutcome::skipped(format!(
            "application fee {} already recorded as {}",
            fee.id, existing.id
        )));
    }

    let parent = unit.payment_by_charge(&fee.charge).await?;

    let mut backfill = unit
        .leg_by_charge(TransactionType::PlatformCommission, &fee.charge)
        .await?;
    if backfill.is_none() {
        if let Some(parent) = &parent {
            backfill = unit
                .children_of(parent.id)
                .await?
                .into_iter()
                .find(|child| child.transaction_type == TransactionType::PlatformCommission);
        }
    }

    let amount = from_minor_units(fee.amount);
    let (mut leg, is_new) = match backfill {
        Some(mut leg) => {
            if leg.markers.correlation.application_fee_id.is_some() {
                return Ok(HandlerOutcome::skipped(format!(
                    "platform commission {} already linked to a fee",
                    leg.id
                )));
            }
            leg.amount = amount;
            if leg.status == TransactionStatus::Pending {
                leg.transition(TransactionStatus::Success, now)?;
            }
            leg.updated_at = now;
            (leg, false)
        }
        None => {
            let mut leg = Transaction::settled(
                TransactionType::PlatformCommission,
                amount,
                fee.currency.to_lowercase(),
                now,
            );
            if let Some(parent) = &parent {
                leg.parent_transaction_id = Some(parent.id);
                leg.booking_id = parent.booking_id;
                leg.payment_intent_id = parent.payment_intent_id.clone();
                leg.payer_id = parent.payee_id.clone();
            }
            (leg, true)
        }
    };

    leg.external_txn_id = Some(fee.id.clone());
    leg.charge_id = Some(fee.charge.clone());
    leg.markers.correlation.application_fee_id = Some(fee.id.clone());
    leg.markers.correlation.connected_account = fee.account.clone();
    leg.markers.correlation.source_event_id = Some(event_id.to_string());

    match &parent {
        Some(parent) => check_conservation(unit, parent, &leg).await?,
        None => tracing::warn!(
            fee_id = %fee.id,
            charge_id = %fee.charge,
            "Application fee has no resolvable originating payment, recording without parent"
        ),
    }

    if is_new {
        unit.insert_transaction(&leg).await?;
    } else {
        unit.update_transaction(&leg).await?;
    }
    Ok(HandlerOutcome::Applied)
}
