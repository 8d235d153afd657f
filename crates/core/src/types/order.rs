//! The two representations of an order.
//!
//! One order concept, two records: the commerce backend's authoritative order
//! and the content store's read mirror for internal dashboards. The mirror
//! carries a [`NonAuthoritative`] tag and exposes no amount accessor that
//! pricing or fulfillment code could mistake for the real one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::authority::NonAuthoritative;
use super::cart::Carrier;
use super::id::{CartId, OrderId, PaymentEventId, PaymentReference};
use super::price::{CurrencyCode, Money};
use super::status::FulfillmentStatus;

/// The commerce backend's durable record of a completed purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeOrder {
    /// Commerce-backend order id.
    pub id: OrderId,
    /// Cart the order was completed from.
    pub source_cart_id: CartId,
    /// Order total as computed by the backend.
    pub total: Money,
    /// Processor reference recorded as proof of payment.
    pub payment_reference: PaymentReference,
}

/// Read-only summary of an order kept in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorOrder {
    /// Payment event that produced the order.
    pub payment_event_id: PaymentEventId,
    /// Processor payment reference.
    pub payment_reference: PaymentReference,
    /// Authoritative order this mirror points to.
    pub order_id: OrderId,
    /// Cart the order was completed from.
    pub source_cart_id: CartId,
    /// Total at completion time, for dashboards only.
    pub total_minor_units: i64,
    /// Currency of `total_minor_units`.
    pub currency: CurrencyCode,
    /// Carrier chosen at checkout, if known.
    pub carrier: Option<Carrier>,
    /// Fulfillment status; the only field updated after creation.
    #[serde(default)]
    pub fulfillment_status: FulfillmentStatus,
    /// When the mirror was created.
    pub created_at: DateTime<Utc>,
    authoritative: NonAuthoritative,
}

impl MirrorOrder {
    /// Build the mirror of an authoritative order.
    #[must_use]
    pub fn of(
        order: &AuthoritativeOrder,
        payment_event_id: PaymentEventId,
        carrier: Option<Carrier>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_event_id,
            payment_reference: order.payment_reference.clone(),
            order_id: order.id.clone(),
            source_cart_id: order.source_cart_id.clone(),
            total_minor_units: order.total.minor_units,
            currency: order.total.currency,
            carrier,
            fulfillment_status: FulfillmentStatus::default(),
            created_at,
            authoritative: NonAuthoritative,
        }
    }

    /// Always `false`.
    #[must_use]
    pub const fn is_authoritative(&self) -> bool {
        self.authoritative.is_authoritative()
    }
}

/// Either representation of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRepresentation {
    /// The commerce backend's record.
    Authoritative(AuthoritativeOrder),
    /// The content store's read mirror.
    Mirror(MirrorOrder),
}

impl OrderRepresentation {
    /// Order id both representations share.
    #[must_use]
    pub const fn order_id(&self) -> &OrderId {
        match self {
            Self::Authoritative(order) => &order.id,
            Self::Mirror(mirror) => &mirror.order_id,
        }
    }

    /// Whether this is the commerce backend's record.
    #[must_use]
    pub const fn is_authoritative(&self) -> bool {
        matches!(self, Self::Authoritative(_))
    }

    /// The order total, available only from the authoritative record.
    #[must_use]
    pub const fn authoritative_total(&self) -> Option<Money> {
        match self {
            Self::Authoritative(order) => Some(order.total),
            Self::Mirror(_) => None,
        }
    }
}
