mod common;

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};

use common::harness;
use payflow_core::domain::{BatchKind, BatchStatus};
use payflow_core::error::PipelineError;
use payflow_core::services::allocator::AllocationError;
use proptest::prelude::*;

async fn redeem_sequence(batches: Vec<i64>, requests: Vec<i64>) -> Result<(), TestCaseError> {
    let h = harness();
    let rewards = &h.state.rewards;

    let mut batch_ids = Vec::new();
    for amount in &batches {
        let batch = rewards
            .award(BatchKind::Points, "user_9", &BigDecimal::from(*amount), None)
            .await
            .unwrap();
        batch_ids.push(batch.id);
    }
    let earned: i64 = batches.iter().sum();

    let mut consumed = 0i64;
    for request in requests {
        let before = rewards.balance(BatchKind::Points, "user_9").await.unwrap();
        let mut snapshot = Vec::new();
        for id in &batch_ids {
            snapshot.push(h.store.batch(*id).await.unwrap());
        }

        match rewards.redeem_points("user_9", &BigDecimal::from(request)).await {
            Ok(allocation) => {
                consumed += request;
                let deducted = allocation
                    .deductions
                    .iter()
                    .fold(BigDecimal::from(0), |acc, d| acc + &d.amount);
                prop_assert_eq!(deducted, BigDecimal::from(request));
            }
            Err(PipelineError::Allocation(AllocationError::InsufficientBalance { .. })) => {
                prop_assert!(before < BigDecimal::from(request));
                let after = rewards.balance(BatchKind::Points, "user_9").await.unwrap();
                prop_assert_eq!(after, before);
                for (id, prior) in batch_ids.iter().zip(&snapshot) {
                    prop_assert_eq!(&h.store.batch(*id).await.unwrap(), prior);
                }
            }
            Err(other) => panic!("unexpected error: {}", other),
        }

        let mut remaining = BigDecimal::from(0);
        for id in &batch_ids {
            let batch = h.store.batch(*id).await.unwrap();
            prop_assert!(batch.remaining >= BigDecimal::from(0));
            prop_assert_eq!(
                batch.status == BatchStatus::Redeemed,
                batch.remaining == BigDecimal::from(0)
            );
            remaining = remaining + batch.remaining;
        }
        let balance = rewards.balance(BatchKind::Points, "user_9").await.unwrap();
        prop_assert_eq!(&remaining, &balance);
        prop_assert_eq!(balance, BigDecimal::from(earned - consumed));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_redemptions_conserve_value(
        batches in prop::collection::vec(1i64..=50, 1..8),
        requests in prop::collection::vec(1i64..=60, 1..25),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(redeem_sequence(batches, requests))?;
    }
}

#[tokio::test]
async fn test_older_batches_drain_first() {
    let h = harness();
    let rewards = &h.state.rewards;
    let first = rewards
        .award(BatchKind::Points, "user_fifo", &BigDecimal::from(10), None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = rewards
        .award(BatchKind::Points, "user_fifo", &BigDecimal::from(10), None)
        .await
        .unwrap();

    let allocation = rewards
        .redeem_points("user_fifo", &BigDecimal::from(12))
        .await
        .unwrap();
    assert_eq!(allocation.deductions.len(), 2);
    assert_eq!(allocation.deductions[0].batch_id, first.id);
    assert_eq!(allocation.deductions[0].amount, BigDecimal::from(10));
    assert_eq!(allocation.deductions[1].batch_id, second.id);

    assert_eq!(h.store.batch(first.id).await.unwrap().status, BatchStatus::Redeemed);
    assert_eq!(
        h.store.batch(second.id).await.unwrap().remaining,
        BigDecimal::from(8)
    );
}

#[tokio::test]
async fn test_expired_batches_are_not_spendable() {
    let h = harness();
    let rewards = &h.state.rewards;
    let past = Utc::now() - Duration::hours(1);
    rewards
        .award(BatchKind::Points, "user_exp", &BigDecimal::from(25), Some(past))
        .await
        .unwrap();
    rewards
        .award(BatchKind::Points, "user_exp", &BigDecimal::from(5), None)
        .await
        .unwrap();

    let summary = rewards.expire(Utc::now(), 100).await.unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.forfeited, BigDecimal::from(25));

    assert!(matches!(
        rewards.redeem_points("user_exp", &BigDecimal::from(6)).await,
        Err(PipelineError::Allocation(AllocationError::InsufficientBalance { .. }))
    ));
    assert_eq!(
        rewards.balance(BatchKind::Points, "user_exp").await.unwrap(),
        BigDecimal::from(5)
    );
}

#[tokio::test]
async fn test_expired_batch_is_not_spent_before_the_sweep() {
    let h = harness();
    let rewards = &h.state.rewards;
    let past = Utc::now() - Duration::minutes(5);
    let stale = rewards
        .award(BatchKind::Points, "user_unswept", &BigDecimal::from(40), Some(past))
        .await
        .unwrap();
    let fresh = rewards
        .award(BatchKind::Points, "user_unswept", &BigDecimal::from(10), None)
        .await
        .unwrap();

    // No expiry sweep has run, so the stale batch is still ACTIVE.
    assert!(matches!(
        rewards.redeem_points("user_unswept", &BigDecimal::from(20)).await,
        Err(PipelineError::Allocation(AllocationError::InsufficientBalance { .. }))
    ));

    let allocation = rewards
        .redeem_points("user_unswept", &BigDecimal::from(10))
        .await
        .unwrap();
    assert_eq!(allocation.deductions.len(), 1);
    assert_eq!(allocation.deductions[0].batch_id, fresh.id);

    let stale = h.store.batch(stale.id).await.unwrap();
    assert_eq!(stale.remaining, BigDecimal::from(40));
    assert_eq!(stale.status, BatchStatus::Active);
}
