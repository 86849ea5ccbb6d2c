use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::{Allocation, BatchKind, BatchStatus, Deduction, EarnBatch};
use crate::ports::{RepositoryError, UnitOfWork};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: BigDecimal,
        available: BigDecimal,
    },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(BigDecimal),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Deducts `requested` from `batches` oldest first. The caller passes
/// batches already in FIFO order. On error nothing is modified.
pub fn allocate_fifo(
    batches: &mut [EarnBatch],
    requested: &BigDecimal,
    now: DateTime<Utc>,
) -> Result<Allocation, AllocationError> {
    if *requested <= BigDecimal::zero() {
        return Err(AllocationError::InvalidAmount(requested.clone()));
    }

    let available = batches
        .iter()
        .fold(BigDecimal::zero(), |acc, b| acc + &b.remaining);
    if available < *requested {
        return Err(AllocationError::InsufficientBalance {
            requested: requested.clone(),
            available,
        });
    }

    let mut needed = requested.clone();
    let mut deductions = Vec::new();

    for batch in batches.iter_mut() {
        if needed.is_zero() {
            break;
        }
        if batch.remaining <= BigDecimal::zero() {
            continue;
        }

        let take = if batch.remaining < needed {
            batch.remaining.clone()
        } else {
            needed.clone()
        };
        batch.remaining = &batch.remaining - &take;
        needed = &needed - &take;
        batch.updated_at = now;
        if batch.remaining.is_zero() {
            batch.status = BatchStatus::Redeemed;
        }

        deductions.push(Deduction {
            batch_id: batch.id,
            amount: take,
        });
    }

    Ok(Allocation {
        consumed: requested.clone(),
        deductions,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpirySummary {
    pub batches: usize,
    pub forfeited: BigDecimal,
}

/// Batch allocator bound to a unit of work. It never commits; the caller
/// owns the transaction so a failed request leaves every batch untouched.
pub struct BatchAllocator;

impl BatchAllocator {
    pub async fn consume(
        unit: &mut dyn UnitOfWork,
        kind: BatchKind,
        subject_id: &str,
        amount: &BigDecimal,
    ) -> Result<Allocation, BatchError> {
        let now = Utc::now();
        let mut batches = unit.active_batches(kind, subject_id, now).await?;
        let allocation = allocate_fifo(&mut batches, amount, now)?;

        for deduction in &allocation.deductions {
            if let Some(batch) = batches.iter().find(|b| b.id == deduction.batch_id) {
                unit.save_batch(batch).await?;
            }
        }
        unit.adjust_balance(kind, subject_id, &-amount.clone()).await?;

        tracing::debug!(
            kind = ?kind,
            subject = %subject_id,
            consumed = %allocation.consumed,
            batches = allocation.deductions.len(),
            "Consumed earn batches"
        );
        Ok(allocation)
    }

    /// Forfeits up to `limit` batches whose expiry has passed.
    pub async fn expire(
        unit: &mut dyn UnitOfWork,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<ExpirySummary, RepositoryError> {
        let batches = unit.expired_batches(now, limit).await?;
        let mut forfeited_by_subject: HashMap<(BatchKind, String), BigDecimal> = HashMap::new();
        let mut summary = ExpirySummary::default();

        for mut batch in batches {
            let forfeited = std::mem::replace(&mut batch.remaining, BigDecimal::zero());
            batch.status = BatchStatus::Expired;
            batch.updated_at = now;
            unit.save_batch(&batch).await?;

            summary.batches += 1;
            summary.forfeited = &summary.forfeited + &forfeited;
            let entry = forfeited_by_subject
                .entry((batch.kind, batch.subject_id.clone()))
                .or_insert_with(BigDecimal::zero);
            *entry = &*entry + &forfeited;
        }

        for ((kind, subject_id), forfeited) in forfeited_by_subject {
            if !forfeited.is_zero() {
                unit.adjust_balance(kind, &subject_id, &-forfeited).await?;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn batch(remaining: i64, earned_secs_ago: i64) -> EarnBatch {
        let mut batch = EarnBatch::new(
            BatchKind::Points,
            "user_1".to_string(),
            BigDecimal::from(remaining),
            None,
        );
        batch.earned_at = Utc::now() - Duration::seconds(earned_secs_ago);
        batch
    }

    #[test]
    fn test_consume_spans_batches_oldest_first() {
        let mut batches = vec![batch(30, 20), batch(50, 10)];
        let allocation = allocate_fifo(&mut batches, &BigDecimal::from(60), Utc::now()).unwrap();

        assert_eq!(allocation.consumed, BigDecimal::from(60));
        assert_eq!(allocation.deductions.len(), 2);
        assert_eq!(allocation.deductions[0].amount, BigDecimal::from(30));
        assert_eq!(allocation.deductions[1].amount, BigDecimal::from(30));
        assert_eq!(batches[0].remaining, BigDecimal::from(0));
        assert_eq!(batches[0].status, BatchStatus::Redeemed);
        assert_eq!(batches[1].remaining, BigDecimal::from(20));
        assert_eq!(batches[1].status, BatchStatus::Active);
    }

    #[test]
    fn test_insufficient_balance_leaves_batches_unchanged() {
        let mut batches = vec![batch(30, 20), batch(50, 10)];
        let before = batches.clone();

        let err = allocate_fifo(&mut batches, &BigDecimal::from(81), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            AllocationError::InsufficientBalance { ref available, .. } if *available == BigDecimal::from(80)
        ));
        assert_eq!(batches, before);
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let mut batches = vec![batch(30, 20)];
        assert!(matches!(
            allocate_fifo(&mut batches, &BigDecimal::from(0), Utc::now()),
            Err(AllocationError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_exact_total_drains_everything() {
        let mut batches = vec![batch(30, 20), batch(50, 10)];
        allocate_fifo(&mut batches, &BigDecimal::from(80), Utc::now()).unwrap();
        assert!(batches
            .iter()
            .all(|b| b.remaining.is_zero() && b.status == BatchStatus::Redeemed));
    }
}
