//! Best-effort outbound notifications.
//!
//! Callers log notification failures and carry on; nothing here is part of
//! a durability boundary.

use async_trait::async_trait;
use redline_core::{CartId, Email, Money, OrderId, QuoteKind, QuoteRequestId};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when sending a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },

    /// Client could not be configured.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Something worth telling the customer or staff about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A quote or wholesale request was stored.
    QuoteSubmitted {
        /// Stored request id.
        id: QuoteRequestId,
        /// Entry point.
        kind: QuoteKind,
        /// Contact name.
        name: String,
        /// Contact email.
        email: Email,
    },
    /// An order was completed in the commerce backend.
    OrderPlaced {
        /// Authoritative order id.
        order_id: OrderId,
        /// Cart it was completed from.
        cart_id: CartId,
        /// Customer email from the cart.
        email: Email,
        /// Amount captured.
        total: Money,
    },
}

impl Notification {
    /// Metric name used by the notification service.
    #[must_use]
    pub const fn metric(&self) -> &'static str {
        match self {
            Self::QuoteSubmitted { .. } => "Submitted Quote Request",
            Self::OrderPlaced { .. } => "Placed Order",
        }
    }
}

/// Sends notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification.
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier used when no notification service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!(
            metric = notification.metric(),
            "Notifications disabled, dropping"
        );
        Ok(())
    }
}
