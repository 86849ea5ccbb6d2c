use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::{Allocation, BatchKind, EarnBatch};
use crate::error::PipelineError;
use crate::ports::{LedgerStore, RepositoryResult};
use crate::services::allocator::{BatchAllocator, ExpirySummary};
use crate::services::lock::{lock_key, LockManager};

#[derive(Clone)]
pub struct RewardService {
    ledger: Arc<dyn LedgerStore>,
    locks: LockManager,
}

impl RewardService {
    pub fn new(ledger: Arc<dyn LedgerStore>, locks: LockManager) -> Self {
        Self { ledger, locks }
    }

    /// Grants a new ACTIVE batch and raises the subject's balance with it.
    pub async fn award(
        &self,
        kind: BatchKind,
        subject_id: &str,
        amount: &BigDecimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<EarnBatch, PipelineError> {
        if *amount <= BigDecimal::zero() {
            return Err(PipelineError::Invariant(format!(
                "award must be positive, got {}",
                amount
            )));
        }

        let batch = EarnBatch::new(kind, subject_id.to_string(), amount.clone(), expires_at);
        let mut unit = self.ledger.begin().await?;
        let written = async {
            unit.insert_batch(&batch).await?;
            unit.adjust_balance(kind, subject_id, amount).await
        }
        .await;

        match written {
            Ok(balance) => {
                unit.commit().await?;
                tracing::info!(kind = ?kind, subject = %subject_id, amount = %amount, balance = %balance, "Awarded batch");
                Ok(batch)
            }
            Err(e) => {
                unit.rollback().await?;
                Err(e.into())
            }
        }
    }

    pub async fn redeem_points(
        &self,
        user_id: &str,
        amount: &BigDecimal,
    ) -> Result<Allocation, PipelineError> {
        self.consume(BatchKind::Points, user_id, amount).await
    }

    /// Two redemptions of one code race for the same batches, so they are
    /// serialized on the code.
    pub async fn redeem_coupon(
        &self,
        code: &str,
        amount: &BigDecimal,
    ) -> Result<Allocation, PipelineError> {
        let key = lock_key("coupon", &["redeem", code]);
        self.locks
            .with_lock(&key, || self.consume(BatchKind::CouponValue, code, amount))
            .await
    }

    async fn consume(
        &self,
        kind: BatchKind,
        subject_id: &str,
        amount: &BigDecimal,
    ) -> Result<Allocation, PipelineError> {
        let mut unit = self.ledger.begin().await?;
        match BatchAllocator::consume(unit.as_mut(), kind, subject_id, amount).await {
            Ok(allocation) => {
                unit.commit().await?;
                Ok(allocation)
            }
            Err(e) => {
                unit.rollback().await?;
                Err(e.into())
            }
        }
    }

    /// One bounded expiry pass.
    pub async fn expire(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<ExpirySummary> {
        let mut unit = self.ledger.begin().await?;
        match BatchAllocator::expire(unit.as_mut(), now, limit).await {
            Ok(summary) => {
                unit.commit().await?;
                if summary.batches > 0 {
                    tracing::info!(
                        batches = summary.batches,
                        forfeited = %summary.forfeited,
                        "Expired earn batches"
                    );
                }
                Ok(summary)
            }
            Err(e) => {
                unit.rollback().await?;
                Err(e)
            }
        }
    }

    pub async fn balance(&self, kind: BatchKind, subject_id: &str) -> RepositoryResult<BigDecimal> {
        self.ledger.balance(kind, subject_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryLockStore, MemoryStore};
    use crate::domain::BatchStatus;
    use crate::services::allocator::AllocationError;
    use crate::services::lock::LockOptions;
    use chrono::Duration;

    fn service() -> (MemoryStore, RewardService) {
        let store = MemoryStore::new();
        let locks = LockManager::new(Arc::new(MemoryLockStore::new()), LockOptions::default());
        (store.clone(), RewardService::new(Arc::new(store), locks))
    }

    #[tokio::test]
    async fn test_award_then_redeem_keeps_balance_in_step() {
        let (_, rewards) = service();
        rewards
            .award(BatchKind::Points, "user_1", &BigDecimal::from(30), None)
            .await
            .unwrap();
        rewards
            .award(BatchKind::Points, "user_1", &BigDecimal::from(50), None)
            .await
            .unwrap();

        let allocation = rewards
            .redeem_points("user_1", &BigDecimal::from(60))
            .await
            .unwrap();
        assert_eq!(allocation.consumed, BigDecimal::from(60));
        assert_eq!(
            rewards.balance(BatchKind::Points, "user_1").await.unwrap(),
            BigDecimal::from(20)
        );
    }

    #[tokio::test]
    async fn test_overdraw_fails_and_changes_nothing() {
        let (store, rewards) = service();
        let batch = rewards
            .award(BatchKind::CouponValue, "SUMMER", &BigDecimal::from(10), None)
            .await
            .unwrap();

        let result = rewards.redeem_coupon("SUMMER", &BigDecimal::from(11)).await;
        assert!(matches!(
            result,
            Err(PipelineError::Allocation(AllocationError::InsufficientBalance { .. }))
        ));
        assert_eq!(store.batch(batch.id).await.unwrap().remaining, BigDecimal::from(10));
        assert_eq!(
            rewards.balance(BatchKind::CouponValue, "SUMMER").await.unwrap(),
            BigDecimal::from(10)
        );
    }

    #[tokio::test]
    async fn test_expire_forfeits_only_past_batches() {
        let (store, rewards) = service();
        let now = Utc::now();
        let stale = rewards
            .award(BatchKind::Points, "user_2", &BigDecimal::from(15), Some(now - Duration::hours(1)))
            .await
            .unwrap();
        rewards
            .award(BatchKind::Points, "user_2", &BigDecimal::from(5), Some(now + Duration::days(30)))
            .await
            .unwrap();

        let summary = rewards.expire(now, 100).await.unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.forfeited, BigDecimal::from(15));
        assert_eq!(store.batch(stale.id).await.unwrap().status, BatchStatus::Expired);
        assert_eq!(
            rewards.balance(BatchKind::Points, "user_2").await.unwrap(),
            BigDecimal::from(5)
        );
    }

    #[tokio::test]
    async fn test_concurrent_coupon_redemptions_never_overdraw() {
        let (_, rewards) = service();
        rewards
            .award(BatchKind::CouponValue, "WINTER", &BigDecimal::from(10), None)
            .await
            .unwrap();

        let a = rewards.clone();
        let b = rewards.clone();
        let seven = BigDecimal::from(7);
        let (first, second) = tokio::join!(
            a.redeem_coupon("WINTER", &seven),
            b.redeem_coupon("WINTER", &seven),
        );
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(
            rewards.balance(BatchKind::CouponValue, "WINTER").await.unwrap(),
            BigDecimal::from(3)
        );
    }
}
