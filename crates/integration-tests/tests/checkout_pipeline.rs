//! Checkout through reconciliation at the service layer.
//!
//! Every test wires a fresh [`TestContext`]; nothing is shared between
//! tests.

#![allow(clippy::unwrap_used)]

use redline_core::{
    ContactInfo, EventStatus, FulfillmentMethodId, NewQuoteRequest, QuoteKind, QuoteLine,
};
use redline_integration_tests::{
    DHL_EXPRESS, PAYMENT_SUCCEEDED, SUBTOTAL_MINOR, TestContext, UPS_GROUND_MINOR, event_id,
    success_event, usd,
};
use redline_storefront::commerce::CommerceBackend;
use redline_storefront::db::EventLedger;
use redline_storefront::services::{
    CheckoutError, MirrorStatus, Notification, QuoteError, ReceiverError, ReceiverOutcome,
    ReconcileError, Reconciliation,
};
use serde_json::json;

fn completed(outcome: ReceiverOutcome) -> (String, bool, MirrorStatus) {
    match outcome {
        ReceiverOutcome::Reconciled(Reconciliation::Completed {
            order_id,
            already_completed,
            mirror,
        }) => (order_id.into_inner(), already_completed, mirror),
        other => panic!("expected a completed order, got {other:?}"),
    }
}

#[tokio::test]
async fn test_paid_cart_becomes_one_order_and_one_mirror() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_scenario_a");

    let session = ctx.checkout(&cart_id).await;
    assert_eq!(session.total(), usd(SUBTOTAL_MINOR + UPS_GROUND_MINOR));
    assert_eq!(session.entries().len(), 3);
    assert_eq!(session.metadata().carrier.as_str(), "ups");

    let body = success_event(&session, "evt_a_1", PAYMENT_SUCCEEDED, "pi_a_1", 10_500);
    let (order_id, already_completed, mirror_status) = completed(ctx.deliver(&body).await.unwrap());

    assert!(!already_completed);
    assert_eq!(mirror_status, MirrorStatus::Written);
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.commerce.order_for(&cart_id).unwrap().as_str(), order_id);

    let mirrors = ctx.content_store.mirrors();
    assert_eq!(mirrors.len(), 1);
    let mirror = mirrors.first().unwrap();
    assert!(!mirror.is_authoritative());
    assert_eq!(mirror.order_id.as_str(), order_id);
    assert_eq!(mirror.total_minor_units, 10_500);
    assert_eq!(mirror.carrier.as_ref().unwrap().as_str(), "ups");
    assert_eq!(
        serde_json::to_value(mirror).unwrap()["authoritative"],
        json!(false)
    );

    let entry = ctx
        .ledger
        .find(&mirror.payment_event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EventStatus::Completed);
    assert!(!entry.mirror_pending);
    assert_eq!(entry.attempts, 1);

    let sent = ctx.notifier.sent();
    assert!(matches!(
        sent.as_slice(),
        [Notification::OrderPlaced { total, .. }] if *total == usd(10_500)
    ));
}

#[tokio::test]
async fn test_cart_changed_after_checkout_is_not_completed() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_scenario_b");
    let session = ctx.checkout(&cart_id).await;

    // Another tab removes a lug nut set after the session was built.
    ctx.commerce.update_cart(&cart_id, |cart| {
        if let Some(lugs) = cart.items.last_mut() {
            lugs.quantity = 1;
        }
        cart.subtotal = usd(8_500);
        cart.total = usd(9_000);
    });

    let body = success_event(&session, "evt_b_1", PAYMENT_SUCCEEDED, "pi_b_1", 10_500);
    let err = ctx.deliver(&body).await.unwrap_err();

    match err {
        ReceiverError::Reconcile(ReconcileError::AmountMismatch { captured, live, .. }) => {
            assert_eq!(captured, usd(10_500));
            assert_eq!(live, usd(9_000));
        }
        other => panic!("expected an amount mismatch, got {other:?}"),
    }
    assert_eq!(ctx.commerce.orders_created(), 0);
    assert_eq!(ctx.commerce.completion_calls(), 0);
    assert!(ctx.content_store.mirrors().is_empty());
    assert!(ctx.notifier.sent().is_empty());

    let entries = ctx.ledger.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries.first().unwrap().status, EventStatus::Rejected);
}

#[tokio::test]
async fn test_rejected_payment_stays_parked_until_released() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_parked");
    let session = ctx.checkout(&cart_id).await;
    ctx.commerce.update_cart(&cart_id, |cart| cart.total = usd(9_000));

    let body = success_event(&session, "evt_parked", PAYMENT_SUCCEEDED, "pi_parked", 10_500);
    assert!(ctx.deliver(&body).await.is_err());

    // Redelivery does not retry a consistency failure on its own.
    let again = ctx.deliver(&body).await.unwrap_err();
    assert!(matches!(
        again,
        ReceiverError::Reconcile(ReconcileError::PreviouslyRejected(_))
    ));
    assert_eq!(ctx.commerce.completion_calls(), 0);

    // An operator fixes the cart and releases the event.
    ctx.commerce.update_cart(&cart_id, |cart| cart.total = usd(10_500));
    let released = ctx
        .ledger
        .release(&event_id("evt_parked"))
        .await
        .unwrap();
    assert_eq!(released.status, EventStatus::Failed);

    let (_, already_completed, _) = completed(ctx.deliver(&body).await.unwrap());
    assert!(!already_completed);
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.ledger.entries().first().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_disallowed_carrier_never_reaches_payment_processor() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_scenario_d");
    let dhl = FulfillmentMethodId::parse(DHL_EXPRESS).unwrap();

    let options = ctx.state.checkout().fulfillment_options(&cart_id).await.unwrap();
    assert_eq!(options.len(), 2);
    assert!(options.iter().all(|option| option.carrier.as_str() != "dhl"));

    let err = ctx
        .state
        .checkout()
        .select_fulfillment(&cart_id, &dhl)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::CarrierNotAllowed(ref c) if c.as_str() == "dhl"));
    assert!(ctx.commerce.get_cart(&cart_id).await.unwrap().fulfillment.is_none());

    // Attached behind the storefront's back: the session build still refuses.
    ctx.commerce.attach_fulfillment(&cart_id, &dhl).await.unwrap();
    let err = ctx.state.checkout().build(&cart_id, None).await.unwrap_err();
    assert!(matches!(err, CheckoutError::CarrierNotAllowed(_)));
    assert!(ctx.payments.requests().is_empty());
}

#[tokio::test]
async fn test_session_build_validates_cart_state() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_validation");

    let err = ctx.state.checkout().build(&cart_id, None).await.unwrap_err();
    assert!(matches!(err, CheckoutError::NoFulfillment));

    let session = ctx.checkout(&cart_id).await;
    let fedex = FulfillmentMethodId::parse("so_fedex_2day").unwrap();
    let err = ctx
        .state
        .checkout()
        .build(&cart_id, Some(&fedex))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::FulfillmentMismatch { .. }));

    ctx.commerce.update_cart(&cart_id, |cart| cart.items.clear());
    let err = ctx.state.checkout().build(&cart_id, None).await.unwrap_err();
    assert!(matches!(err, CheckoutError::EmptyCart));

    // Only the one good build reached the processor.
    assert_eq!(ctx.payments.requests().len(), 1);
    assert_eq!(session.url(), "https://pay.example.test/c/cs_test_1");
}

#[tokio::test]
async fn test_rebuilding_unchanged_cart_reuses_session() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_rebuild");

    let first = ctx.checkout(&cart_id).await;
    let second = ctx.state.checkout().build(&cart_id, None).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(ctx.payments.sessions_created(), 1);

    ctx.commerce.update_cart(&cart_id, |cart| {
        if let Some(coilovers) = cart.items.first_mut() {
            coilovers.quantity = 2;
        }
        cart.subtotal = usd(18_000);
        cart.total = usd(18_500);
    });
    let third = ctx.state.checkout().build(&cart_id, None).await.unwrap();
    assert_ne!(first.id(), third.id());
    assert_eq!(third.total(), usd(18_500));
}

#[tokio::test]
async fn test_transient_completion_failures_are_retried() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_flaky");
    let session = ctx.checkout(&cart_id).await;
    ctx.commerce.fail_next_completions(2);

    let body = success_event(&session, "evt_flaky", PAYMENT_SUCCEEDED, "pi_flaky", 10_500);
    completed(ctx.deliver(&body).await.unwrap());

    assert_eq!(ctx.commerce.completion_calls(), 3);
    assert_eq!(ctx.commerce.orders_created(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_release_claim_for_redelivery() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_outage");
    let session = ctx.checkout(&cart_id).await;
    ctx.commerce.fail_next_completions(5);

    let body = success_event(&session, "evt_outage", PAYMENT_SUCCEEDED, "pi_outage", 10_500);
    let err = ctx.deliver(&body).await.unwrap_err();
    assert!(matches!(
        err,
        ReceiverError::Reconcile(ReconcileError::Commerce(_))
    ));
    assert_eq!(ctx.commerce.orders_created(), 0);
    assert_eq!(ctx.ledger.entries().first().unwrap().status, EventStatus::Failed);

    completed(ctx.deliver(&body).await.unwrap());
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert_eq!(ctx.ledger.entries().first().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_mirror_failure_leaves_order_and_remirror_repairs_it() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_mirror_down");
    let session = ctx.checkout(&cart_id).await;
    ctx.content_store.fail_next_mirror_writes(3);

    let body = success_event(&session, "evt_mirror", PAYMENT_SUCCEEDED, "pi_mirror", 10_500);
    let (order_id, _, mirror_status) = completed(ctx.deliver(&body).await.unwrap());

    assert_eq!(mirror_status, MirrorStatus::Pending);
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert!(ctx.content_store.mirrors().is_empty());
    let entry = ctx.ledger.entries().into_iter().next().unwrap();
    assert_eq!(entry.status, EventStatus::Completed);
    assert!(entry.mirror_pending);
    assert!(entry.last_error.is_some());

    let report = ctx.state.reconciler().remirror_pending(10).await.unwrap();
    assert_eq!(report.mirrored, 1);
    assert_eq!(report.pending, 0);

    let mirrors = ctx.content_store.mirrors();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors.first().unwrap().order_id.as_str(), order_id);
    assert!(!ctx.ledger.entries().first().unwrap().mirror_pending);
    assert_eq!(ctx.commerce.completion_calls(), 1);
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_order() {
    let ctx = TestContext::new();
    let cart_id = ctx.seed_cart("cart_quiet");
    let session = ctx.checkout(&cart_id).await;
    ctx.notifier.fail(true);

    let body = success_event(&session, "evt_quiet", PAYMENT_SUCCEEDED, "pi_quiet", 10_500);
    let (_, _, mirror_status) = completed(ctx.deliver(&body).await.unwrap());

    assert_eq!(mirror_status, MirrorStatus::Written);
    assert_eq!(ctx.commerce.orders_created(), 1);
    assert!(ctx.notifier.sent().is_empty());
}

fn wholesale_request(company: Option<&str>) -> NewQuoteRequest {
    NewQuoteRequest {
        kind: QuoteKind::Wholesale,
        contact: ContactInfo {
            name: "Dana Reyes".to_string(),
            email: "dana@boostedtuning.example".to_string(),
            phone: None,
            company: company.map(str::to_string),
        },
        vehicle: None,
        lines: vec![QuoteLine {
            description: "Intercooler kits, monthly".to_string(),
            quantity: 12,
            reference: Some("IC-FMIC-02".to_string()),
        }],
        notes: None,
    }
}

#[tokio::test]
async fn test_quote_is_stored_then_notified() {
    let ctx = TestContext::new();

    let id = ctx
        .state
        .quotes()
        .submit(wholesale_request(Some("Boosted Tuning LLC")))
        .await
        .unwrap();

    let stored = ctx.content_store.quotes();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored.first().unwrap().id, id);
    assert!(matches!(
        ctx.notifier.sent().as_slice(),
        [Notification::QuoteSubmitted { kind: QuoteKind::Wholesale, .. }]
    ));
}

#[tokio::test]
async fn test_quote_survives_notification_failure() {
    let ctx = TestContext::new();
    ctx.notifier.fail(true);

    ctx.state
        .quotes()
        .submit(wholesale_request(Some("Boosted Tuning LLC")))
        .await
        .unwrap();
    assert_eq!(ctx.content_store.quotes().len(), 1);
}

#[tokio::test]
async fn test_invalid_quote_is_not_stored() {
    let ctx = TestContext::new();

    let err = ctx
        .state
        .quotes()
        .submit(wholesale_request(None))
        .await
        .unwrap_err();
    assert!(matches!(err, QuoteError::Validation(_)));
    assert!(ctx.content_store.quotes().is_empty());
    assert!(ctx.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_quote_store_failure_is_reported() {
    let ctx = TestContext::new();
    ctx.content_store.reject_quotes(true);

    let err = ctx
        .state
        .quotes()
        .submit(wholesale_request(Some("Boosted Tuning LLC")))
        .await
        .unwrap_err();
    assert!(matches!(err, QuoteError::Store(_)));
    assert!(ctx.notifier.sent().is_empty());
}
