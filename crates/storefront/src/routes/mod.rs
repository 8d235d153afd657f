//! HTTP route handlers for storefront.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                               - Liveness
//! GET  /health/ready                         - Event ledger connectivity
//!
//! # Checkout (public, rate limited)
//! GET  /api/checkout/fulfillment-options     - Allowed shipping options for a cart
//! POST /api/checkout/fulfillment             - Attach a shipping option
//! POST /api/checkout/session                 - Create a payment session
//! GET  /api/orders/confirmation/{cart_id}    - Confirmed or pending
//! POST /api/quotes                           - Quote / wholesale request
//!
//! # Payment processor
//! POST /api/webhooks/payments                - Signed payment events
//! ```

pub mod checkout;
pub mod health;
pub mod orders;
pub mod quotes;
pub mod webhooks;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Liveness and readiness probes.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
}

/// Customer-facing API routes.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/checkout/fulfillment-options",
            get(checkout::fulfillment_options),
        )
        .route("/api/checkout/fulfillment", post(checkout::select_fulfillment))
        .route("/api/checkout/session", post(checkout::create_session))
        .route(
            "/api/orders/confirmation/{cart_id}",
            get(orders::confirmation),
        )
        .route("/api/quotes", post(quotes::submit))
}

/// Routes called by the payment processor.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/payments", post(webhooks::payment_webhook))
}

/// All routes, without rate limiting.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health_routes())
        .merge(public_routes())
        .merge(webhook_routes())
}
