//! Integration tests for the Redline checkout pipeline.
//!
//! The storefront's services and routes run against in-memory stand-ins for
//! the commerce backend, the payment processor, the content store, the
//! event ledger and the notifier, so the whole cart to order path can be
//! exercised without network access or a database.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p redline-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `checkout_pipeline` - Checkout through reconciliation, service level
//! - `webhook_idempotency` - Duplicate and concurrent deliveries
//! - `http_api` - The routes as a client and the processor see them

pub mod fakes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use redline_core::{
    CartId, Carrier, CheckoutSession, CurrencyCode, Email, FulfillmentMethodId, LineItem, Money,
    PaymentEventId, PricedCart, SessionMetadata, VariantId,
};
use redline_storefront::commerce::FulfillmentOption;
use redline_storefront::payments::WebhookVerifier;
use redline_storefront::routes;
use redline_storefront::services::{ReceiverError, ReceiverOutcome, RetryPolicy};
use redline_storefront::state::{AppState, Backends};
use secrecy::SecretString;
use serde_json::json;

pub use fakes::{FakeCommerce, FakeContentStore, FakePayments, MemoryLedger, RecordingNotifier};

/// Webhook secret shared by the test processor and the verifier.
pub const WEBHOOK_SECRET: &str = "whsec_redline_integration_secret";

/// Event type the processor sends when a payment intent is captured.
pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";

/// Shipping option with an allowed carrier.
pub const UPS_GROUND: &str = "so_ups_ground";

/// Shipping option whose carrier is not on the allow-list.
pub const DHL_EXPRESS: &str = "so_dhl_express";

/// Items subtotal of the scenario cart, in cents.
pub const SUBTOTAL_MINOR: i64 = 10_000;

/// UPS ground price, in cents.
pub const UPS_GROUND_MINOR: i64 = 500;

/// Shorthand for a USD amount in cents.
#[must_use]
pub const fn usd(minor: i64) -> Money {
    Money::from_minor(minor, CurrencyCode::USD)
}

/// A wired storefront plus handles on every fake behind it.
pub struct TestContext {
    pub commerce: Arc<FakeCommerce>,
    pub payments: Arc<FakePayments>,
    pub content_store: Arc<FakeContentStore>,
    pub ledger: Arc<MemoryLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub verifier: WebhookVerifier,
    pub state: AppState,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// Storefront allowing UPS and FedEx, with millisecond retry delays.
    #[must_use]
    pub fn new() -> Self {
        let commerce = Arc::new(FakeCommerce::default());
        let payments = Arc::new(FakePayments::default());
        let content_store = Arc::new(FakeContentStore::default());
        let ledger = Arc::new(MemoryLedger::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let verifier = WebhookVerifier::new(
            SecretString::from(WEBHOOK_SECRET.to_string()),
            Duration::from_secs(300),
        );

        let backends = Backends {
            commerce: commerce.clone(),
            payments: payments.clone(),
            content_store: content_store.clone(),
            ledger: ledger.clone(),
            notifier: notifier.clone(),
        };
        let state = AppState::assemble(
            backends,
            verifier.clone(),
            vec![Carrier::new("ups"), Carrier::new("fedex")],
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_secs(300),
        );

        Self {
            commerce,
            payments,
            content_store,
            ledger,
            notifier,
            verifier,
            state,
        }
    }

    /// All routes over this context, without rate limiting.
    #[must_use]
    pub fn router(&self) -> Router {
        routes::routes().with_state(self.state.clone())
    }

    /// Seed a two-line cart (subtotal $100.00) with UPS, FedEx and DHL
    /// options, and no shipping attached yet.
    ///
    /// # Panics
    ///
    /// Panics if `cart_id` is not a valid id.
    pub fn seed_cart(&self, cart_id: &str) -> CartId {
        let cart_id = CartId::parse(cart_id).expect("valid cart id");
        let item = |variant: &str, title: &str, quantity, unit| LineItem {
            variant_id: VariantId::parse(variant).expect("valid variant id"),
            title: title.to_string(),
            quantity,
            unit_price: usd(unit),
            options: Vec::new(),
        };

        self.commerce.insert_cart(PricedCart {
            id: cart_id.clone(),
            currency: CurrencyCode::USD,
            email: Some(Email::parse("driver@example.com").expect("valid email")),
            items: vec![
                item("variant_coilovers", "Street Coilover Kit", 1, 8_000),
                item("variant_lugs", "Forged Lug Nut Set", 2, 1_000),
            ],
            fulfillment: None,
            subtotal: usd(SUBTOTAL_MINOR),
            total: usd(SUBTOTAL_MINOR),
            completed: false,
        });

        let option = |id: &str, carrier: &str, service: &str, amount| FulfillmentOption {
            id: FulfillmentMethodId::parse(id).expect("valid option id"),
            name: format!("{} {service}", carrier.to_uppercase()),
            carrier: Carrier::new(carrier),
            service: service.to_string(),
            amount: usd(amount),
        };
        self.commerce.set_options(
            &cart_id,
            vec![
                option(UPS_GROUND, "ups", "ground", UPS_GROUND_MINOR),
                option("so_fedex_2day", "fedex", "2day", 1_500),
                option(DHL_EXPRESS, "dhl", "express", 900),
            ],
        );

        cart_id
    }

    /// Attach UPS ground and build a payment session through the service
    /// layer.
    ///
    /// # Panics
    ///
    /// Panics if either step fails.
    pub async fn checkout(&self, cart_id: &CartId) -> CheckoutSession {
        let ups = FulfillmentMethodId::parse(UPS_GROUND).expect("valid option id");
        self.state
            .checkout()
            .select_fulfillment(cart_id, &ups)
            .await
            .expect("select UPS ground");
        self.state
            .checkout()
            .build(cart_id, Some(&ups))
            .await
            .expect("build checkout session")
    }

    /// Sign a body the way the processor does, timestamped now.
    ///
    /// # Panics
    ///
    /// Panics if the secret cannot key an HMAC.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        self.verifier
            .sign(body, Utc::now().timestamp())
            .expect("sign webhook body")
    }

    /// Deliver a signed body straight to the webhook receiver.
    ///
    /// # Errors
    ///
    /// Returns whatever the receiver returns.
    pub async fn deliver(&self, body: &[u8]) -> Result<ReceiverOutcome, ReceiverError> {
        let header = self.sign(body);
        self.state
            .receiver()
            .receive(body, Some(&header), Utc::now())
            .await
    }
}

/// Parse an event id literal.
///
/// # Panics
///
/// Panics if `id` is not a valid id.
#[must_use]
pub fn event_id(id: &str) -> PaymentEventId {
    PaymentEventId::parse(id).expect("valid event id")
}

/// Body of a success event for `session`, as the processor would send it
/// after capturing `captured_minor` cents.
///
/// # Panics
///
/// Panics if the JSON cannot be serialized.
#[must_use]
pub fn success_event(
    session: &CheckoutSession,
    event_id: &str,
    event_type: &str,
    payment_reference: &str,
    captured_minor: i64,
) -> Vec<u8> {
    success_event_with(
        session.metadata(),
        event_id,
        event_type,
        payment_reference,
        captured_minor,
    )
}

/// Like [`success_event`], for when only the session metadata is at hand.
///
/// # Panics
///
/// Panics if the JSON cannot be serialized.
#[must_use]
pub fn success_event_with(
    metadata: &SessionMetadata,
    event_id: &str,
    event_type: &str,
    payment_reference: &str,
    captured_minor: i64,
) -> Vec<u8> {
    let metadata: serde_json::Map<String, serde_json::Value> = metadata
        .to_pairs()
        .into_iter()
        .map(|(key, value)| (key.to_string(), json!(value)))
        .collect();

    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": {
            "id": payment_reference,
            "object": "payment_intent",
            "amount": captured_minor,
            "amount_received": captured_minor,
            "currency": "usd",
            "metadata": metadata,
        }}
    }))
    .expect("serialize event")
}

/// Body of an event type the pipeline does not act on.
///
/// # Panics
///
/// Panics if the JSON cannot be serialized.
#[must_use]
pub fn ignored_event(event_id: &str, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": { "id": "ch_refund_1", "amount": 500, "currency": "usd" } }
    }))
    .expect("serialize event")
}
