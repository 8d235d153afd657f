//! Payment events as delivered by the payment processor.
//!
//! Delivery is at-least-once and unordered. The event id is the idempotency
//! key for order creation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::checkout::{MetadataError, SessionMetadata};
use super::id::{PaymentEventId, PaymentReference};
use super::price::Money;

/// A verified, parsed payment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Processor-assigned unique event id.
    pub id: PaymentEventId,
    /// Raw type tag (e.g. `payment_intent.succeeded`).
    pub event_type: String,
    /// What the receiver should do with it.
    pub kind: PaymentEventKind,
}

/// Dispatch classification of a payment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentEventKind {
    /// Money was captured; reconcile into an order.
    Succeeded(PaymentSucceeded),
    /// Any other event; acknowledged and dropped.
    Ignored,
}

/// Payload of a successful payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    /// Processor payment reference (payment intent id).
    pub payment_reference: PaymentReference,
    /// Amount actually captured.
    pub amount_captured: Money,
    /// Metadata recorded at session creation.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PaymentSucceeded {
    /// Recover the checkout context from the metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the payment was not created through the checkout
    /// session builder (missing or malformed keys).
    pub fn session_metadata(&self) -> Result<SessionMetadata, MetadataError> {
        SessionMetadata::from_map(&self.metadata)
    }
}

impl PaymentEvent {
    /// Whether this event should be handed to the order reconciler.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.kind, PaymentEventKind::Succeeded(_))
    }
}
