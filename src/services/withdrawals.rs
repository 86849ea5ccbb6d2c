use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    to_minor_units, Transaction, TransactionType, WithdrawalRequest, WithdrawalStatus,
};
use crate::error::PipelineError;
use crate::gateway::CreateTransfer;
use crate::ports::{LedgerStore, PaymentGateway, UnitOfWork};
use crate::services::lock::{lock_key, LockManager};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalApproved {
    pub request_id: Uuid,
    pub payout_transaction_id: Uuid,
    pub transfer_id: String,
}

#[derive(Clone)]
pub struct WithdrawalService {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: LockManager,
}

impl WithdrawalService {
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

    pub async fn approve(&self, request_id: Uuid) -> Result<WithdrawalApproved, PipelineError> {
        let id = request_id.to_string();
        let key = lock_key("withdrawal", &[&id]);
        self.locks
            .with_lock(&key, || self.approve_locked(request_id))
            .await
    }

    async fn approve_locked(&self, request_id: Uuid) -> Result<WithdrawalApproved, PipelineError> {
        let mut unit = self.ledger.begin().await?;
        let loaded = pending_request(unit.as_mut(), request_id).await;
        unit.rollback().await?;
        let request = loaded?;

        let destination = request.connected_account.clone().ok_or_else(|| {
            PipelineError::MissingLinkage(format!(
                "host {} has no connected account",
                request.host_id
            ))
        })?;
        let amount = to_minor_units(&request.amount).ok_or_else(|| {
            PipelineError::Invariant(format!("amount {} is not a whole number of minor units", request.amount))
        })?;

        // Keyed on the request so a retried approval cannot pay twice.
        let transfer = self
            .gateway
            .create_transfer(&CreateTransfer {
                amount,
                currency: request.currency.clone(),
                destination: destination.clone(),
                withdrawal_request_id: request.id,
                idempotency_key: format!("withdrawal-{}", request.id),
            })
            .await?;

        let now = Utc::now();
        let mut unit = self.ledger.begin().await?;
        let written = async {
            let mut request = pending_request(unit.as_mut(), request_id).await?;

            let mut payout = Transaction::settled(
                TransactionType::HostPayout,
                request.amount.clone(),
                request.currency.clone(),
                now,
            );
            payout.payee_id = Some(request.host_id.clone());
            payout.transfer_id = Some(transfer.id.clone());
            payout.external_txn_id = Some(transfer.id.clone());
            payout.markers.correlation.connected_account = Some(destination.clone());
            payout.markers.correlation.withdrawal_request_id = Some(request.id);
            unit.insert_transaction(&payout).await?;

            request.status = WithdrawalStatus::Approved;
            request.transfer_id = Some(transfer.id.clone());
            request.approved_at = Some(now);
            request.updated_at = now;
            unit.save_withdrawal_request(&request).await?;
            Ok::<_, PipelineError>(payout.id)
        }
        .await;

        match written {
            Ok(payout_id) => {
                unit.commit().await?;
                tracing::info!(
                    request_id = %request_id,
                    transfer_id = %transfer.id,
                    "Withdrawal approved"
                );
                Ok(WithdrawalApproved {
                    request_id,
                    payout_transaction_id: payout_id,
                    transfer_id: transfer.id,
                })
            }
            Err(e) => {
                unit.rollback().await?;
                tracing::error!(
                    request_id = %request_id,
                    transfer_id = %transfer.id,
                    "Transfer created but withdrawal not recorded: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

async fn pending_request(
    unit: &mut dyn UnitOfWork,
    request_id: Uuid,
) -> Result<WithdrawalRequest, PipelineError> {
    let request = unit
        .withdrawal_request(request_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("withdrawal request {}", request_id)))?;
    if request.status != WithdrawalStatus::Pending {
        return Err(PipelineError::Invariant(format!(
            "withdrawal request {} is already {:?}",
            request.id, request.status
        )));
    }
    Ok(request)
}
