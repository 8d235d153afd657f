//! Unified error handling with Sentry integration.
//!
//! Provides a unified `AppError` type that captures server-side errors to
//! Sentry before responding to the client. All route handlers return
//! `Result<T, AppError>`.
//!
//! | Class | Status | Body |
//! |-------|--------|------|
//! | validation | 400 / 404 / 422 | user-safe reason |
//! | signature | 400 | `invalid signature` |
//! | consistency | 422 | generic |
//! | permanent webhook failure | 200 | `{"received": true}`, from the route |
//! | in-flight duplicate | 409 | generic |
//! | transient downstream | 503 | generic |
//! | anything else | 500 | generic |

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::commerce::CommerceError;
use crate::db::RepositoryError;
use crate::services::{
    CheckoutError, PricingError, QuoteError, ReceiverError, ReconcileError, Transient,
};

const UNAVAILABLE: &str = "Service temporarily unavailable, please retry";
const INTERNAL: &str = "Internal server error";

/// Application-level error type for the storefront.
#[derive(Debug, Error)]
pub enum AppError {
    /// Checkout or fulfillment selection failed.
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    /// A payment webhook could not be processed.
    #[error(transparent)]
    Webhook(#[from] ReceiverError),

    /// A quote submission failed.
    #[error(transparent)]
    Quote(#[from] QuoteError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

struct Classified {
    status: StatusCode,
    message: String,
    capture: bool,
}

impl Classified {
    fn client(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            capture: false,
        }
    }

    fn server(transient: bool) -> Self {
        if transient {
            Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: UNAVAILABLE.to_string(),
                capture: true,
            }
        } else {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: INTERNAL.to_string(),
                capture: true,
            }
        }
    }
}

fn classify_pricing(err: &PricingError) -> Classified {
    match err {
        PricingError::CartNotFound(_) => {
            Classified::client(StatusCode::NOT_FOUND, "Cart not found")
        }
        PricingError::Backend(e) => Classified::server(e.is_transient()),
    }
}

fn classify_commerce(err: &CommerceError) -> Classified {
    match err {
        CommerceError::NotFound(_) => {
            Classified::client(StatusCode::NOT_FOUND, "Cart or shipping option not found")
        }
        other => Classified::server(other.is_transient()),
    }
}

fn classify_checkout(err: &CheckoutError) -> Classified {
    match err {
        CheckoutError::Pricing(e) => classify_pricing(e),
        CheckoutError::EmptyCart
        | CheckoutError::AlreadyCompleted
        | CheckoutError::NoFulfillment
        | CheckoutError::FulfillmentMismatch { .. }
        | CheckoutError::UnknownFulfillmentOption(_)
        | CheckoutError::CarrierNotAllowed(_) => {
            Classified::client(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        CheckoutError::TotalMismatch { .. } => Classified {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: "Cart total cannot be itemized for payment".to_string(),
            capture: true,
        },
        CheckoutError::Money(_) => Classified::server(false),
        CheckoutError::Commerce(e) => classify_commerce(e),
        CheckoutError::Payment(e) => Classified::server(e.is_transient()),
    }
}

fn classify_reconcile(err: &ReconcileError) -> Classified {
    match err {
        ReconcileError::AmountMismatch { .. }
        | ReconcileError::CartAlreadyPaid { .. }
        | ReconcileError::PreviouslyRejected(_) => {
            Classified::client(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Payment could not be reconciled",
            )
        }
        ReconcileError::InFlight(_) => {
            Classified::client(StatusCode::CONFLICT, "Payment is already being processed")
        }
        other => Classified::server(other.is_transient()),
    }
}

fn classify_webhook(err: &ReceiverError) -> Classified {
    match err {
        ReceiverError::Signature(_) => Classified::client(StatusCode::BAD_REQUEST, "invalid signature"),
        ReceiverError::Malformed(_) => Classified::client(StatusCode::BAD_REQUEST, "malformed event"),
        ReceiverError::Metadata { .. } => Classified {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: "Payment could not be reconciled".to_string(),
            capture: true,
        },
        ReceiverError::Reconcile(e) => classify_reconcile(e),
    }
}

impl AppError {
    fn classify(&self) -> Classified {
        match self {
            Self::Checkout(e) => classify_checkout(e),
            Self::Webhook(e) => classify_webhook(e),
            Self::Quote(QuoteError::Validation(e)) => {
                Classified::client(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            Self::Quote(QuoteError::Store(e)) => Classified::server(e.is_transient()),
            Self::Database(e) => Classified::server(e.is_transient()),
            Self::BadRequest(message) => Classified::client(StatusCode::BAD_REQUEST, message),
            Self::NotFound(what) => {
                Classified::client(StatusCode::NOT_FOUND, format!("{what} not found"))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let classified = self.classify();

        // Capture server errors to Sentry
        if classified.capture {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                status = %classified.status,
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(error = %self, status = %classified.status, "Request rejected");
        }

        (
            classified.status,
            Json(json!({ "error": classified.message })),
        )
            .into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use redline_core::{CartId, Carrier, CurrencyCode, Money, PaymentEventId};

    use super::*;
    use crate::payments::SignatureError;

    fn get_status(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::NotFound("cart".to_string());
        assert_eq!(err.to_string(), "Not found: cart");

        let err = AppError::BadRequest("invalid input".to_string());
        assert_eq!(err.to_string(), "Bad request: invalid input");
    }

    #[test]
    fn test_validation_errors_are_client_errors() {
        assert_eq!(
            get_status(CheckoutError::CarrierNotAllowed(Carrier::new("dhl"))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            get_status(CheckoutError::EmptyCart),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            get_status(CheckoutError::Pricing(PricingError::CartNotFound(
                CartId::parse("cart_01").unwrap()
            ))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_status(AppError::BadRequest("test".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_signature_errors_are_bad_request() {
        assert_eq!(
            get_status(ReceiverError::Signature(SignatureError::Mismatch)),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_reconcile_classes() {
        let mismatch = ReconcileError::AmountMismatch {
            cart_id: CartId::parse("cart_01").unwrap(),
            captured: Money::from_minor(10500, CurrencyCode::USD),
            live: Money::from_minor(9000, CurrencyCode::USD),
        };
        assert_eq!(
            get_status(ReceiverError::Reconcile(mismatch)),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let in_flight = ReconcileError::InFlight(PaymentEventId::parse("evt_1").unwrap());
        assert_eq!(
            get_status(ReceiverError::Reconcile(in_flight)),
            StatusCode::CONFLICT
        );

        let transient = ReconcileError::Commerce(CommerceError::RateLimited);
        assert_eq!(
            get_status(ReceiverError::Reconcile(transient)),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let permanent = ReconcileError::Commerce(CommerceError::Completion("payment".into()));
        assert_eq!(
            get_status(ReceiverError::Reconcile(permanent)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
