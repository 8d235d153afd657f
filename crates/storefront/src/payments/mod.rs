//! Payment processor integration.
//!
//! - [`PaymentProcessor`] creates hosted payment sessions
//! - [`StripeClient`] implements it over the Stripe REST API
//! - [`WebhookVerifier`] checks webhook signatures before anything is parsed
//! - [`parse_event`] turns a verified webhook body into a [`PaymentEvent`]
//!
//! [`PaymentEvent`]: redline_core::PaymentEvent

mod event;
mod signature;
mod stripe;

use async_trait::async_trait;
use redline_core::{
    CartId, CheckoutSession, CurrencyCode, Email, PaymentLineEntry, SessionMetadata,
};
use thiserror::Error;

use crate::services::retry::Transient;

pub use event::parse_event;
pub use signature::{SIGNATURE_HEADER, SignatureError, WebhookVerifier};
pub use stripe::StripeClient;

/// Errors that can occur when talking to the payment processor.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited by the processor.
    #[error("Rate limited")]
    RateLimited,

    /// The processor rejected the request.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Processor error message.
        message: String,
    },

    /// The processor returned data we cannot interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A webhook body that verified but cannot be read as an event.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

impl Transient for PaymentError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::MalformedEvent(_) => false,
        }
    }
}

/// Everything the processor needs to open a payment page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    /// Cart being paid for (sent as the client reference).
    pub cart_id: CartId,
    /// Currency of every entry.
    pub currency: CurrencyCode,
    /// Line entries at authoritative prices.
    pub entries: Vec<PaymentLineEntry>,
    /// Context the webhook needs to finish the order.
    pub metadata: SessionMetadata,
    /// Prefill for the payment page.
    pub customer_email: Option<Email>,
    /// Key that makes an identical resubmission return the same session.
    pub idempotency_key: String,
}

/// Operations the checkout pipeline needs from the payment processor.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a hosted payment session.
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentError>;
}
