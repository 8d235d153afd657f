//! Checkout session types.
//!
//! A [`CheckoutSession`] is the priced snapshot handed to the payment
//! processor. It has no setters: a cart that changes after the session was
//! built needs a new session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cart::Carrier;
use super::id::{CartId, CheckoutSessionId, FulfillmentMethodId};
use super::price::{CurrencyCode, Money, MoneyError};

/// One line shown on the payment page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLineEntry {
    /// Product or shipping label.
    pub name: String,
    /// Authoritative unit amount at build time.
    pub unit_amount: Money,
    /// Quantity.
    pub quantity: u32,
}

impl PaymentLineEntry {
    /// `unit_amount * quantity`.
    ///
    /// # Errors
    ///
    /// Returns `MoneyError::Overflow` if the product does not fit.
    pub fn total(&self) -> Result<Money, MoneyError> {
        self.unit_amount.checked_mul(self.quantity)
    }
}

/// Errors reading [`SessionMetadata`] back from a payment event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// A required key is absent or blank.
    #[error("session metadata is missing `{0}`")]
    Missing(&'static str),
    /// A key is present but its value is malformed.
    #[error("session metadata `{key}` is invalid: {reason}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Context embedded in a payment session so the webhook can recover it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Commerce-backend cart the payment is for.
    pub source_cart_id: CartId,
    /// Fulfillment method attached when the session was built.
    pub fulfillment_method_id: FulfillmentMethodId,
    /// Carrier of that method.
    pub carrier: Carrier,
}

impl SessionMetadata {
    /// Metadata key for the source cart id.
    pub const SOURCE_CART_ID: &'static str = "source_cart_id";
    /// Metadata key for the fulfillment method id.
    pub const FULFILLMENT_METHOD_ID: &'static str = "fulfillment_method_id";
    /// Metadata key for the carrier.
    pub const CARRIER: &'static str = "carrier";

    /// Flatten to key/value pairs in a stable order.
    #[must_use]
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            (Self::SOURCE_CART_ID, self.source_cart_id.to_string()),
            (
                Self::FULFILLMENT_METHOD_ID,
                self.fulfillment_method_id.to_string(),
            ),
            (Self::CARRIER, self.carrier.to_string()),
        ]
    }

    /// Read metadata back from the map a payment event carries.
    ///
    /// # Errors
    ///
    /// Returns `Missing` for an absent or blank key and `Invalid` for a
    /// malformed id.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, MetadataError> {
        fn required<'a>(
            map: &'a BTreeMap<String, String>,
            key: &'static str,
        ) -> Result<&'a str, MetadataError> {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or(MetadataError::Missing(key))
        }

        let source_cart_id = CartId::parse(required(map, Self::SOURCE_CART_ID)?).map_err(|e| {
            MetadataError::Invalid {
                key: Self::SOURCE_CART_ID,
                reason: e.to_string(),
            }
        })?;
        let fulfillment_method_id =
            FulfillmentMethodId::parse(required(map, Self::FULFILLMENT_METHOD_ID)?).map_err(
                |e| MetadataError::Invalid {
                    key: Self::FULFILLMENT_METHOD_ID,
                    reason: e.to_string(),
                },
            )?;
        let carrier = Carrier::new(required(map, Self::CARRIER)?);

        Ok(Self {
            source_cart_id,
            fulfillment_method_id,
            carrier,
        })
    }
}

/// An immutable payment-collection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    id: CheckoutSessionId,
    url: String,
    metadata: SessionMetadata,
    entries: Vec<PaymentLineEntry>,
    total: Money,
    expires_at: Option<DateTime<Utc>>,
}

impl CheckoutSession {
    /// Assemble a session from what the processor returned and the entries
    /// it was created with. The total is derived from the entries.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is in a different currency or the sum
    /// overflows.
    pub fn new(
        id: CheckoutSessionId,
        url: String,
        currency: CurrencyCode,
        metadata: SessionMetadata,
        entries: Vec<PaymentLineEntry>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self, MoneyError> {
        let total = sum_entries(currency, &entries)?;
        Ok(Self {
            id,
            url,
            metadata,
            entries,
            total,
            expires_at,
        })
    }

    /// Processor session id.
    #[must_use]
    pub const fn id(&self) -> &CheckoutSessionId {
        &self.id
    }

    /// URL the customer is redirected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cart this session charges for.
    #[must_use]
    pub const fn source_cart_id(&self) -> &CartId {
        &self.metadata.source_cart_id
    }

    /// Embedded metadata.
    #[must_use]
    pub const fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Line entries shown on the payment page.
    #[must_use]
    pub fn entries(&self) -> &[PaymentLineEntry] {
        &self.entries
    }

    /// Sum of all entries.
    #[must_use]
    pub const fn total(&self) -> Money {
        self.total
    }

    /// When the processor expires an unpaid session, if reported.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

/// Sum a list of payment entries in `currency`.
///
/// # Errors
///
/// Returns an error on currency mismatch or overflow.
pub fn sum_entries(currency: CurrencyCode, entries: &[PaymentLineEntry]) -> Result<Money, MoneyError> {
    entries
        .iter()
        .try_fold(Money::zero(currency), |acc, entry| acc.checked_add(entry.total()?))
}
