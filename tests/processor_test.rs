mod common;

use bigdecimal::BigDecimal;
use serde_json::json;

use common::{event, harness, payment_failed, payment_succeeded, seed_checkout, session_expired};
use payflow_core::domain::{BookingStatus, TransactionStatus, TransactionType, WebhookEventStatus};
use payflow_core::error::PipelineError;
use payflow_core::ports::EventStore;
use payflow_core::services::HandlerOutcome;

#[tokio::test]
async fn test_concurrent_duplicate_success_applies_once() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_1", 2).await;
    let delivery = payment_succeeded("evt_success", &checkout, Some(1000));

    let first = h.state.processor.clone();
    let second = h.state.processor.clone();
    let (a, b) = tokio::join!(first.process(&delivery), second.process(&delivery));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| format!("{:?}", o));
    assert_eq!(outcomes, vec![HandlerOutcome::Applied, HandlerOutcome::Duplicate]);

    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Success);
    assert_eq!(payment.charge_id.as_deref(), Some("ch_pi_1"));

    let booking = h.store.booking(checkout.booking.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);

    let commissions = h
        .store
        .transactions_of_type(TransactionType::PlatformCommission)
        .await;
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].amount, BigDecimal::from(10));
    assert_eq!(commissions[0].parent_transaction_id, Some(checkout.payment.id));

    let stored = h.store.get("evt_success").await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Processed);
}

#[tokio::test]
async fn test_sequential_redelivery_is_a_duplicate() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_2", 1).await;
    let delivery = payment_succeeded("evt_again", &checkout, None);

    assert_eq!(h.state.processor.process(&delivery).await.unwrap(), HandlerOutcome::Applied);
    assert_eq!(h.state.processor.process(&delivery).await.unwrap(), HandlerOutcome::Duplicate);
}

#[tokio::test]
async fn test_expiry_after_success_is_a_no_op() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_3", 2).await;

    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, None))
        .await
        .unwrap();
    let outcome = h
        .state
        .processor
        .process(&session_expired("evt_expired", &checkout))
        .await
        .unwrap();

    assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
    let booking = h.store.booking(checkout.booking.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    let inventory = h.store.inventory(checkout.booking.event_id).await.unwrap();
    assert_eq!(inventory.available, 8);
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert!(!payment.markers.release.tickets_released);
}

#[tokio::test]
async fn test_failure_after_success_keeps_the_capture() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_4", 1).await;

    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, None))
        .await
        .unwrap();
    let outcome = h
        .state
        .processor
        .process(&payment_failed("evt_failed", &checkout))
        .await
        .unwrap();

    assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Success);
}

#[tokio::test]
async fn test_late_success_after_expiry_wins() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_5", 2).await;

    h.state
        .processor
        .process(&session_expired("evt_expired", &checkout))
        .await
        .unwrap();
    assert_eq!(
        h.store.inventory(checkout.booking.event_id).await.unwrap().available,
        10
    );
    assert_eq!(
        h.store.booking(checkout.booking.id).await.unwrap().status,
        BookingStatus::Expired
    );

    let outcome = h
        .state
        .processor
        .process(&payment_succeeded("evt_late", &checkout, None))
        .await
        .unwrap();
    assert_eq!(outcome, HandlerOutcome::Applied);

    let booking = h.store.booking(checkout.booking.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Success);
    assert!(!payment.markers.release.tickets_released);
    assert!(payment.markers.release.reinstated_at.is_some());
    assert_eq!(
        h.store.inventory(checkout.booking.event_id).await.unwrap().available,
        8
    );
}

#[tokio::test]
async fn test_repeated_failures_release_seats_once() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_6", 3).await;

    h.state
        .processor
        .process(&payment_failed("evt_fail_1", &checkout))
        .await
        .unwrap();
    h.state
        .processor
        .process(&payment_failed("evt_fail_2", &checkout))
        .await
        .unwrap();
    h.state
        .processor
        .process(&session_expired("evt_expired", &checkout))
        .await
        .unwrap();

    let inventory = h.store.inventory(checkout.booking.event_id).await.unwrap();
    assert_eq!(inventory.available, 10);

    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Failed);
    assert_eq!(payment.markers.release.released_quantity, Some(3));
    assert_eq!(
        payment.markers.failure_reason.as_deref(),
        Some("Your card was declined.")
    );
    assert_eq!(
        h.store.booking(checkout.booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
}

#[tokio::test]
async fn test_refund_settles_the_initiated_leg() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_7", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, None))
        .await
        .unwrap();

    let initiated = h
        .state
        .refunds
        .initiate(checkout.payment.id, &BigDecimal::from(40), None)
        .await
        .unwrap();

    let refunded = event(
        "evt_refunded",
        "charge.refunded",
        json!({
            "id": "ch_pi_7",
            "payment_intent": "pi_7",
            "amount": 10000,
            "amount_refunded": 4000,
            "currency": "usd",
            "refunds": { "data": [
                { "id": initiated.gateway_refund_id, "amount": 4000, "status": "succeeded" }
            ]},
        }),
    );
    assert_eq!(h.state.processor.process(&refunded).await.unwrap(), HandlerOutcome::Applied);

    let leg = h.store.transaction(initiated.refund_transaction_id).await.unwrap();
    assert_eq!(leg.status, TransactionStatus::Success);
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::PartiallyRefunded);
    assert_eq!(
        h.store.booking(checkout.booking.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn test_full_refund_moves_booking_to_refunded() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_8", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, None))
        .await
        .unwrap();
    let initiated = h
        .state
        .refunds
        .initiate(checkout.payment.id, &BigDecimal::from(100), None)
        .await
        .unwrap();

    let refunded = event(
        "evt_refunded",
        "charge.refunded",
        json!({
            "id": "ch_pi_8",
            "amount": 10000,
            "amount_refunded": 10000,
            "currency": "usd",
            "refunds": { "data": [
                { "id": initiated.gateway_refund_id, "amount": 10000, "status": "succeeded" }
            ]},
        }),
    );
    h.state.processor.process(&refunded).await.unwrap();

    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::FullyRefunded);
    assert_eq!(
        h.store.booking(checkout.booking.id).await.unwrap().status,
        BookingStatus::Refunded
    );
}

#[tokio::test]
async fn test_refund_initiated_elsewhere_is_not_recorded() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_9", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, None))
        .await
        .unwrap();

    let refunded = event(
        "evt_foreign_refund",
        "charge.refunded",
        json!({
            "id": "ch_pi_9",
            "amount": 10000,
            "amount_refunded": 2500,
            "currency": "usd",
            "refunds": { "data": [ { "id": "re_dashboard", "amount": 2500, "status": "succeeded" } ] },
        }),
    );
    let outcome = h.state.processor.process(&refunded).await.unwrap();

    assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
    assert!(h
        .store
        .transactions_of_type(TransactionType::BookingRefund)
        .await
        .is_empty());
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, TransactionStatus::Success);
}

#[tokio::test]
async fn test_fee_and_transfer_legs_respect_conservation() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_10", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, Some(1000)))
        .await
        .unwrap();

    let fee = event(
        "evt_fee",
        "application_fee.created",
        json!({
            "id": "fee_1",
            "amount": 1000,
            "currency": "usd",
            "charge": "ch_pi_10",
            "account": "acct_host_1",
        }),
    );
    assert_eq!(h.state.processor.process(&fee).await.unwrap(), HandlerOutcome::Applied);

    let commissions = h
        .store
        .transactions_of_type(TransactionType::PlatformCommission)
        .await;
    assert_eq!(commissions.len(), 1);
    assert_eq!(
        commissions[0].markers.correlation.application_fee_id.as_deref(),
        Some("fee_1")
    );

    let transfer = event(
        "evt_transfer",
        "transfer.created",
        json!({
            "id": "tr_1",
            "amount": 9000,
            "currency": "usd",
            "destination": "acct_host_1",
            "source_transaction": "ch_pi_10",
        }),
    );
    assert_eq!(h.state.processor.process(&transfer).await.unwrap(), HandlerOutcome::Applied);

    let payouts = h.store.transactions_of_type(TransactionType::SellerPayout).await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].parent_transaction_id, Some(checkout.payment.id));
    assert_eq!(payouts[0].amount, BigDecimal::from(90));

    let excess = event(
        "evt_transfer_excess",
        "transfer.created",
        json!({
            "id": "tr_2",
            "amount": 500,
            "currency": "usd",
            "source_transaction": "ch_pi_10",
        }),
    );
    let err = h.state.processor.process(&excess).await.unwrap_err();
    assert!(matches!(err, PipelineError::Invariant(_)));
    assert!(!err.is_retryable());
    assert_eq!(
        h.store.transactions_of_type(TransactionType::SellerPayout).await.len(),
        1
    );
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let h = harness();
    let outcome = h
        .state
        .processor
        .process(&event("evt_customer", "customer.created", json!({ "id": "cus_1" })))
        .await
        .unwrap();

    assert_eq!(outcome, HandlerOutcome::Ignored);
    let stored = h.store.get("evt_customer").await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Processed);
}

#[tokio::test]
async fn test_missing_charge_is_fetched_from_the_gateway() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_11", 1).await;
    let delivery = event(
        "evt_no_charge",
        "payment_intent.succeeded",
        json!({
            "id": "pi_11",
            "amount": 10000,
            "currency": "usd",
            "metadata": { "booking_id": checkout.booking.id },
        }),
    );

    h.state.processor.process(&delivery).await.unwrap();
    let payment = h.store.transaction(checkout.payment.id).await.unwrap();
    assert_eq!(payment.charge_id.as_deref(), Some("ch_for_pi_11"));
}

#[tokio::test]
async fn test_split_legs_seen_before_success_are_adopted() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_12", 1).await;

    let fee = event(
        "evt_early_fee",
        "application_fee.created",
        json!({
            "id": "fee_early",
            "amount": 1000,
            "currency": "usd",
            "charge": "ch_pi_12",
            "account": "acct_host_1",
        }),
    );
    let transfer = event(
        "evt_early_transfer",
        "transfer.created",
        json!({
            "id": "tr_early",
            "amount": 9000,
            "currency": "usd",
            "destination": "acct_host_1",
            "source_transaction": "ch_pi_12",
        }),
    );
    assert_eq!(h.state.processor.process(&fee).await.unwrap(), HandlerOutcome::Applied);
    assert_eq!(h.state.processor.process(&transfer).await.unwrap(), HandlerOutcome::Applied);

    let orphans = h
        .store
        .transactions_of_type(TransactionType::PlatformCommission)
        .await;
    assert_eq!(orphans.len(), 1);
    assert!(orphans[0].parent_transaction_id.is_none());

    assert_eq!(
        h.state
            .processor
            .process(&payment_succeeded("evt_late_success", &checkout, Some(1000)))
            .await
            .unwrap(),
        HandlerOutcome::Applied
    );

    let commissions = h
        .store
        .transactions_of_type(TransactionType::PlatformCommission)
        .await;
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].id, orphans[0].id);
    assert_eq!(commissions[0].parent_transaction_id, Some(checkout.payment.id));
    assert_eq!(commissions[0].booking_id, Some(checkout.booking.id));

    let payouts = h.store.transactions_of_type(TransactionType::SellerPayout).await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].parent_transaction_id, Some(checkout.payment.id));
    assert_eq!(payouts[0].booking_id, Some(checkout.booking.id));

    let graph = h.state.ledger.graph(checkout.payment.id).await.unwrap();
    assert_eq!(graph.children.len(), 2);
}

#[tokio::test]
async fn test_second_transfer_on_a_charge_gets_its_own_leg() {
    let h = harness();
    let checkout = seed_checkout(&h.store, "pi_13", 1).await;
    h.state
        .processor
        .process(&payment_succeeded("evt_ok", &checkout, Some(1000)))
        .await
        .unwrap();

    for (event_id, transfer_id, amount) in [("evt_tr_a", "tr_a", 6000), ("evt_tr_b", "tr_b", 3000)] {
        let transfer = event(
            event_id,
            "transfer.created",
            json!({
                "id": transfer_id,
                "amount": amount,
                "currency": "usd",
                "source_transaction": "ch_pi_13",
            }),
        );
        assert_eq!(
            h.state.processor.process(&transfer).await.unwrap(),
            HandlerOutcome::Applied
        );
    }

    let mut payouts = h.store.transactions_of_type(TransactionType::SellerPayout).await;
    payouts.sort_by_key(|leg| leg.transfer_id.clone());
    assert_eq!(payouts.len(), 2);
    assert_eq!(payouts[0].transfer_id.as_deref(), Some("tr_a"));
    assert_eq!(payouts[0].amount, BigDecimal::from(60));
    assert_eq!(payouts[1].transfer_id.as_deref(), Some("tr_b"));
    assert_eq!(payouts[1].amount, BigDecimal::from(30));
    assert!(payouts
        .iter()
        .all(|leg| leg.parent_transaction_id == Some(checkout.payment.id)));
}
