//! Commerce backend integration: the pricing authority.
//!
//! The commerce backend owns carts, prices, shipping options and orders.
//! Everything that feeds a transaction amount is read from here at the
//! moment it is needed; nothing is cached.
//!
//! - [`CommerceBackend`] is the seam the pipeline services depend on
//! - [`CommerceClient`] implements it over the backend's REST store API

mod client;
mod wire;

use async_trait::async_trait;
use redline_core::{CartId, Carrier, FulfillmentMethodId, Money, OrderId, PaymentReference, PricedCart};
use thiserror::Error;

use crate::services::retry::Transient;

pub use client::CommerceClient;

/// Errors that can occur when talking to the commerce backend.
#[derive(Debug, Error)]
pub enum CommerceError {
    /// HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited by the backend.
    #[error("Rate limited")]
    RateLimited,

    /// The cart or option does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend answered with an unexpected status.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },

    /// The backend refused to turn the cart into an order.
    #[error("Cart completion failed: {0}")]
    Completion(String),

    /// The backend returned data we cannot interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Transient for CommerceError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500 || *status == 409,
            Self::NotFound(_) | Self::Completion(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// A shipping option the customer may attach to a cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentOption {
    /// Option id, passed back when attaching.
    pub id: FulfillmentMethodId,
    /// Display name.
    pub name: String,
    /// Carrier providing the service.
    pub carrier: Carrier,
    /// Carrier service level.
    pub service: String,
    /// Price for this cart.
    pub amount: Money,
}

/// Result of completing a cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOrder {
    /// Authoritative order id.
    pub order_id: OrderId,
    /// Order total, when the backend reports it.
    pub total: Option<Money>,
    /// The cart had already been completed by an earlier call.
    pub already_completed: bool,
}

/// Operations the checkout pipeline needs from the commerce backend.
#[async_trait]
pub trait CommerceBackend: Send + Sync {
    /// Fetch a cart with live prices and totals.
    async fn get_cart(&self, cart_id: &CartId) -> Result<PricedCart, CommerceError>;

    /// List shipping options available for a cart.
    async fn list_fulfillment_options(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<FulfillmentOption>, CommerceError>;

    /// Attach a shipping option to a cart and return the repriced cart.
    async fn attach_fulfillment(
        &self,
        cart_id: &CartId,
        option_id: &FulfillmentMethodId,
    ) -> Result<PricedCart, CommerceError>;

    /// Convert a cart into an order.
    ///
    /// Must be safe to call more than once for the same cart: a cart that was
    /// already completed yields its existing order with `already_completed`.
    async fn complete_cart(
        &self,
        cart_id: &CartId,
        payment_reference: &PaymentReference,
    ) -> Result<CompletedOrder, CommerceError>;
}
