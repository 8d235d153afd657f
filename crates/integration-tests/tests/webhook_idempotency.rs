//! Duplicate, concurrent and untrusted webhook deliveries.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::Utc;
use redline_core::{CartId, Carrier, EventStatus, PaymentReference};
use redline_integration_tests::{
    PAYMENT_SUCCEEDED, TestContext, event_id, ignored_event, success_event, usd,
};
use redline_storefront::db::{Claim, EventLedger, NewClaim};
use redline_storefront::payments::{SignatureError, WebhookVerifier};
use redline_storefront::services::{
    MirrorStatus, ReceiverError, ReceiverOutcome, ReconcileError, Reconciliation,
};
use secrecy::SecretString;
use serde_json::json;

#[tokio::test]
async fn test_redelivered_event_short_circuits_on_mirror() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_scenario_c");
    let session = ctx.checkout(&cart_id).await;
    let body = success_event(&session, "evt_c_1", PAYMENT_SUCCEEDED, "pi_c_1", 10_500);

    let first = ctx.deliver(&body).await.unwrap();
    let second = ctx.deliver(&body).await.unwrap();

    let ReceiverOutcome::Reconciled(first) = first else {
        panic!("first delivery was not reconciled");
    };
    match second {
        ReceiverOutcome::Reconciled(Reconciliation::AlreadyMirrored { order_id }) => {
            assert_eq!(Some(&order_id), first.order_id());
        }
        other => panic!("second delivery was not short-circuited: {other:?}"),
    }

    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.commerce.completion_calls(), 1);
    assert_eq!(ctx.content_store.mirrors().len(), 1);
    assert_eq!(ctx.content_store.mirror_writes(), 1);
    assert_eq!(ctx.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_concurrent_deliveries_create_one_order() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_concurrent");
    let session = ctx.checkout(&cart_id).await;
    let body = success_event(&session, "evt_race", PAYMENT_SUCCEEDED, "pi_race", 10_500);

    // Both deliveries pass the mirror lookup before either has written.
    let (first, second) = tokio::join!(ctx.deliver(&body), ctx.deliver(&body));

    let outcomes = [first, second];
    let completed = outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome,
                Ok(ReceiverOutcome::Reconciled(Reconciliation::Completed { .. }))
            )
        })
        .count();
    let in_flight = outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome,
                Err(ReceiverError::Reconcile(ReconcileError::InFlight(_)))
            )
        })
        .count();

    assert_eq!(completed, 1);
    assert_eq!(in_flight, 1);
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.commerce.completion_calls(), 1);
    assert_eq!(ctx.content_store.mirrors().len(), 1);
    assert_eq!(ctx.ledger.entries().len(), 1);
}

fn session_completed_event(event_id: &str, payment_reference: &str, cart_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_test_1",
            "object": "checkout.session",
            "payment_status": "paid",
            "payment_intent": payment_reference,
            "amount_total": 10_500,
            "currency": "usd",
            "metadata": {
                "source_cart_id": cart_id,
                "fulfillment_method_id": "so_ups_ground",
                "carrier": "ups",
            },
        }}
    }))
    .unwrap()
}

#[tokio::test]
async fn test_second_event_type_for_same_payment_is_duplicate() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_two_types");
    let session = ctx.checkout(&cart_id).await;

    let intent = success_event(&session, "evt_intent", PAYMENT_SUCCEEDED, "pi_two", 10_500);
    let first = ctx.deliver(&intent).await.unwrap();
    let ReceiverOutcome::Reconciled(Reconciliation::Completed { order_id, .. }) = first else {
        panic!("first event did not complete the order");
    };

    let completed = session_completed_event("evt_session", "pi_two", "cart_two_types");
    let outcome = ctx.deliver(&completed).await.unwrap();

    assert_eq!(
        outcome,
        ReceiverOutcome::Reconciled(Reconciliation::AlreadyMirrored { order_id })
    );
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.ledger.entries().len(), 1);
}

#[tokio::test]
async fn test_ledger_catches_duplicate_when_mirror_is_missing() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_no_mirror");
    let session = ctx.checkout(&cart_id).await;
    ctx.content_store.fail_next_mirror_writes(3);

    let intent = success_event(&session, "evt_first", PAYMENT_SUCCEEDED, "pi_nomirror", 10_500);
    let outcome = ctx.deliver(&intent).await.unwrap();
    assert!(matches!(
        outcome,
        ReceiverOutcome::Reconciled(Reconciliation::Completed {
            mirror: MirrorStatus::Pending,
            ..
        })
    ));

    // The second event type finds no mirror, loses the claim on the shared
    // payment reference, and repairs the mirror on the way out.
    let completed = session_completed_event("evt_second", "pi_nomirror", "cart_no_mirror");
    let outcome = ctx.deliver(&completed).await.unwrap();
    match outcome {
        ReceiverOutcome::Reconciled(Reconciliation::Duplicate { order_id }) => {
            assert_eq!(order_id, ctx.commerce.order_for(&cart_id));
        }
        other => panic!("expected the ledger to report a duplicate, got {other:?}"),
    }
    assert_eq!(ctx.commerce.completion_calls(), 1);
    let mirrors = ctx.content_store.mirrors();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors.first().unwrap().payment_event_id, event_id("evt_first"));
    assert!(!ctx.ledger.entries().first().unwrap().mirror_pending);
}

#[tokio::test]
async fn test_second_payment_for_completed_cart_is_rejected() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_double");
    let session = ctx.checkout(&cart_id).await;

    let first = success_event(&session, "evt_a", PAYMENT_SUCCEEDED, "pi_a", 10_500);
    let outcome = ctx.deliver(&first).await.unwrap();
    assert!(matches!(
        outcome,
        ReceiverOutcome::Reconciled(Reconciliation::Completed {
            already_completed: false,
            ..
        })
    ));

    // The shopper paid again from a second tab.
    let second = success_event(&session, "evt_b", PAYMENT_SUCCEEDED, "pi_b", 10_500);
    let err = ctx.deliver(&second).await.unwrap_err();
    match err {
        ReceiverError::Reconcile(ReconcileError::CartAlreadyPaid {
            cart_id: paid_cart,
            payment_reference,
            paid_by,
            order_id,
        }) => {
            assert_eq!(paid_cart, cart_id);
            assert_eq!(payment_reference.as_str(), "pi_b");
            assert_eq!(paid_by.as_str(), "pi_a");
            assert_eq!(order_id, ctx.commerce.order_for(&cart_id));
        }
        other => panic!("expected the cart to be reported as paid, got {other:?}"),
    }

    assert_eq!(ctx.commerce.orders_created(), 1);
    let mirrors = ctx.content_store.mirrors();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors.first().unwrap().payment_event_id, event_id("evt_a"));
    assert_eq!(ctx.notifier.sent().len(), 1);

    let owner = ctx.ledger.find(&event_id("evt_a")).await.unwrap().unwrap();
    assert_eq!(owner.status, EventStatus::Completed);
    let refused = ctx.ledger.find(&event_id("evt_b")).await.unwrap().unwrap();
    assert_eq!(refused.status, EventStatus::Rejected);
    assert!(refused.order_id.is_none());

    // Redelivery of the refused payment stays refused without touching the cart.
    let err = ctx.deliver(&second).await.unwrap_err();
    assert!(matches!(
        err,
        ReceiverError::Reconcile(ReconcileError::PreviouslyRejected(_))
    ));
    assert_eq!(ctx.commerce.completion_calls(), 1);
    assert_eq!(ctx.content_store.mirrors().len(), 1);
}

#[tokio::test]
async fn test_redelivery_completes_ledger_row_left_processing() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_stuck");
    let session = ctx.checkout(&cart_id).await;
    ctx.ledger.fail_next_completions(1);

    let body = success_event(&session, "evt_stuck", PAYMENT_SUCCEEDED, "pi_stuck", 10_500);
    let outcome = ctx.deliver(&body).await.unwrap();
    let ReceiverOutcome::Reconciled(Reconciliation::Completed {
        order_id,
        mirror: MirrorStatus::Written,
        ..
    }) = outcome
    else {
        panic!("first delivery did not complete and mirror the order");
    };

    let stuck = ctx.ledger.find(&event_id("evt_stuck")).await.unwrap().unwrap();
    assert_eq!(stuck.status, EventStatus::Processing);

    let outcome = ctx.deliver(&body).await.unwrap();
    assert_eq!(
        outcome,
        ReceiverOutcome::Reconciled(Reconciliation::AlreadyMirrored {
            order_id: order_id.clone()
        })
    );

    let repaired = ctx.ledger.find(&event_id("evt_stuck")).await.unwrap().unwrap();
    assert_eq!(repaired.status, EventStatus::Completed);
    assert_eq!(repaired.order_id, Some(order_id));
    assert!(!repaired.mirror_pending);
    assert!(repaired.completed_at.is_some());
    assert_eq!(ctx.commerce.completion_calls(), 1);
}

#[tokio::test]
async fn test_abandoned_claim_is_taken_over_after_lease() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_crashed");
    let session = ctx.checkout(&cart_id).await;

    // A worker claimed the payment and died before finishing.
    let claim = NewClaim {
        event_id: event_id("evt_crash"),
        payment_reference: PaymentReference::parse("pi_crash").unwrap(),
        event_type: PAYMENT_SUCCEEDED.to_string(),
        cart_id: CartId::parse("cart_crashed").unwrap(),
        captured: usd(10_500),
        carrier: Some(Carrier::new("ups")),
    };
    let held = ctx
        .ledger
        .claim(&claim, Duration::from_secs(300))
        .await
        .unwrap();
    assert!(matches!(held, Claim::Acquired(_)));

    let body = success_event(&session, "evt_crash", PAYMENT_SUCCEEDED, "pi_crash", 10_500);
    let err = ctx.deliver(&body).await.unwrap_err();
    assert!(matches!(
        err,
        ReceiverError::Reconcile(ReconcileError::InFlight(_))
    ));
    assert_eq!(ctx.commerce.completion_calls(), 0);

    ctx.ledger
        .age_row(&event_id("evt_crash"), Duration::from_secs(600));
    let outcome = ctx.deliver(&body).await.unwrap();
    assert!(matches!(
        outcome,
        ReceiverOutcome::Reconciled(Reconciliation::Completed { .. })
    ));

    let entry = ctx.ledger.find(&event_id("evt_crash")).await.unwrap().unwrap();
    assert_eq!(entry.status, EventStatus::Completed);
    assert_eq!(entry.attempts, 2);
    assert_eq!(ctx.commerce.orders_created(), 1);
}

#[tokio::test]
async fn test_non_success_event_is_acknowledged_without_side_effects() {
    let ctx = TestContext::new();

    let outcome = ctx
        .deliver(&ignored_event("evt_refund", "charge.refunded"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReceiverOutcome::Ignored {
            event_id: event_id("evt_refund"),
            event_type: "charge.refunded".to_string(),
        }
    );
    assert!(ctx.ledger.entries().is_empty());
    assert_eq!(ctx.commerce.completion_calls(), 0);
}

#[tokio::test]
async fn test_untrusted_deliveries_are_refused_before_parsing() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_forged");
    let session = ctx.checkout(&cart_id).await;
    let body = success_event(&session, "evt_forged", PAYMENT_SUCCEEDED, "pi_forged", 10_500);
    let receiver = ctx.state.receiver();
    let now = Utc::now();

    let missing = receiver.receive(&body, None, now).await.unwrap_err();
    assert!(matches!(
        missing,
        ReceiverError::Signature(SignatureError::MissingHeader)
    ));

    let forger = WebhookVerifier::new(
        SecretString::from("whsec_not_the_real_one".to_string()),
        Duration::from_secs(300),
    );
    let forged = forger.sign(&body, now.timestamp()).unwrap();
    let err = receiver.receive(&body, Some(&forged), now).await.unwrap_err();
    assert!(matches!(
        err,
        ReceiverError::Signature(SignatureError::Mismatch)
    ));

    let replayed = ctx.verifier.sign(&body, now.timestamp() - 3_600).unwrap();
    let err = receiver
        .receive(&body, Some(&replayed), now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReceiverError::Signature(SignatureError::OutsideTolerance)
    ));

    let genuine = ctx.sign(&body);
    let mut tampered = body.clone();
    if let Some(byte) = tampered.iter_mut().find(|byte| **byte == b'5') {
        *byte = b'1';
    }
    let err = receiver
        .receive(&tampered, Some(&genuine), now)
        .await
        .unwrap_err();
    assert!(matches!(err, ReceiverError::Signature(_)));

    assert!(ctx.ledger.entries().is_empty());
    assert_eq!(ctx.commerce.orders_created(), 0);
}

#[tokio::test]
async fn test_success_without_session_metadata_is_not_reconciled() {
    let ctx = TestContext::new();
    let body = serde_json::to_vec(&json!({
        "id": "evt_dashboard",
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": "pi_dashboard",
            "amount_received": 2_500,
            "currency": "usd",
        }}
    }))
    .unwrap();

    let err = ctx.deliver(&body).await.unwrap_err();
    assert!(matches!(err, ReceiverError::Metadata { .. }));
    assert!(ctx.ledger.entries().is_empty());
}
