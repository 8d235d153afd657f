//! Checkout: fulfillment selection and payment session creation.
//!
//! A session is built only from what the pricing authority reports at that
//! instant. The caller supplies a cart id and nothing else that could carry
//! a price.

use std::sync::Arc;

use redline_core::{
    CartId, Carrier, CheckoutSession, FulfillmentMethodId, MoneyError, PaymentLineEntry,
    PricedCart, SessionMetadata, sum_entries,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::pricing::{PricingAuthority, PricingError};
use crate::commerce::{CommerceError, FulfillmentOption};
use crate::payments::{CheckoutSessionRequest, PaymentError, PaymentProcessor};

/// Errors building a checkout session or selecting fulfillment.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Live prices could not be read.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// The cart has no items.
    #[error("cart is empty")]
    EmptyCart,

    /// The cart was already turned into an order.
    #[error("cart is already completed")]
    AlreadyCompleted,

    /// No fulfillment method is attached to the cart.
    #[error("no fulfillment method selected")]
    NoFulfillment,

    /// The attached method is not the one the caller selected.
    #[error("fulfillment method {expected} is not attached to the cart")]
    FulfillmentMismatch {
        /// Method the caller asked for.
        expected: FulfillmentMethodId,
    },

    /// The fulfillment option does not exist for this cart.
    #[error("unknown fulfillment option {0}")]
    UnknownFulfillmentOption(FulfillmentMethodId),

    /// The carrier is outside the allow-list.
    #[error("carrier `{0}` is not allowed")]
    CarrierNotAllowed(Carrier),

    /// The backend's total does not equal the sum of its own line prices
    /// (taxes or discounts this storefront cannot itemize).
    #[error("cart total {backend} does not match itemized total {itemized}")]
    TotalMismatch {
        /// Sum of line entries, in minor units.
        itemized: i64,
        /// Backend total, in minor units.
        backend: i64,
    },

    /// Amount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// The commerce backend refused a fulfillment change.
    #[error(transparent)]
    Commerce(#[from] CommerceError),

    /// The payment processor refused the session.
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// Builds payment sessions from live cart state.
#[derive(Clone)]
pub struct CheckoutSessionBuilder {
    pricing: PricingAuthority,
    payments: Arc<dyn PaymentProcessor>,
    allowed_carriers: Arc<[Carrier]>,
}

impl std::fmt::Debug for CheckoutSessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutSessionBuilder")
            .field("allowed_carriers", &self.allowed_carriers)
            .finish_non_exhaustive()
    }
}

/// Line entries for a priced cart: one per item plus one for fulfillment.
///
/// # Errors
///
/// Returns `NoFulfillment` if no method is attached.
pub fn payment_entries(cart: &PricedCart) -> Result<Vec<PaymentLineEntry>, CheckoutError> {
    let method = cart.fulfillment.as_ref().ok_or(CheckoutError::NoFulfillment)?;

    let mut entries: Vec<PaymentLineEntry> = cart
        .items
        .iter()
        .map(|item| PaymentLineEntry {
            name: item.title.clone(),
            unit_amount: item.unit_price,
            quantity: item.quantity,
        })
        .collect();

    let label = if method.service.is_empty() {
        format!("Shipping ({})", method.carrier.as_str().to_uppercase())
    } else {
        format!(
            "Shipping ({} {})",
            method.carrier.as_str().to_uppercase(),
            method.service
        )
    };
    entries.push(PaymentLineEntry {
        name: label,
        unit_amount: method.amount,
        quantity: 1,
    });

    Ok(entries)
}

/// Hex SHA-256 of everything that determines what the customer pays.
#[must_use]
pub fn snapshot_fingerprint(
    cart_id: &CartId,
    entries: &[PaymentLineEntry],
    metadata: &SessionMetadata,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cart_id.as_str().as_bytes());
    for entry in entries {
        hasher.update([0]);
        hasher.update(entry.name.as_bytes());
        hasher.update(entry.unit_amount.minor_units.to_be_bytes());
        hasher.update(entry.unit_amount.currency.code().as_bytes());
        hasher.update(entry.quantity.to_be_bytes());
    }
    for (key, value) in metadata.to_pairs() {
        hasher.update([0]);
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl CheckoutSessionBuilder {
    /// Create a builder.
    #[must_use]
    pub fn new(
        pricing: PricingAuthority,
        payments: Arc<dyn PaymentProcessor>,
        allowed_carriers: impl Into<Arc<[Carrier]>>,
    ) -> Self {
        Self {
            pricing,
            payments,
            allowed_carriers: allowed_carriers.into(),
        }
    }

    /// The carrier allow-list.
    #[must_use]
    pub fn allowed_carriers(&self) -> &[Carrier] {
        &self.allowed_carriers
    }

    /// Shipping options for a cart, limited to allowed carriers.
    ///
    /// # Errors
    ///
    /// Returns an error if the commerce backend cannot list options.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn fulfillment_options(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<FulfillmentOption>, CheckoutError> {
        let options = self
            .pricing
            .backend()
            .list_fulfillment_options(cart_id)
            .await?;
        Ok(options
            .into_iter()
            .filter(|option| option.carrier.is_allowed(&self.allowed_carriers))
            .collect())
    }

    /// Attach a shipping option after checking its carrier.
    ///
    /// # Errors
    ///
    /// Returns `UnknownFulfillmentOption` or `CarrierNotAllowed` before the
    /// cart is touched, or a backend error.
    #[instrument(skip(self), fields(cart_id = %cart_id, option_id = %option_id))]
    pub async fn select_fulfillment(
        &self,
        cart_id: &CartId,
        option_id: &FulfillmentMethodId,
    ) -> Result<PricedCart, CheckoutError> {
        let backend = self.pricing.backend();
        let option = backend
            .list_fulfillment_options(cart_id)
            .await?
            .into_iter()
            .find(|option| &option.id == option_id)
            .ok_or_else(|| CheckoutError::UnknownFulfillmentOption(option_id.clone()))?;

        if !option.carrier.is_allowed(&self.allowed_carriers) {
            warn!(carrier = %option.carrier, "Rejected fulfillment option with disallowed carrier");
            return Err(CheckoutError::CarrierNotAllowed(option.carrier));
        }

        Ok(backend.attach_fulfillment(cart_id, option_id).await?)
    }

    /// Build a payment session for the cart's current state.
    ///
    /// `expected_method`, when given, must be the method attached to the
    /// cart. Every validation runs before the payment processor is called.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty, completed or unshippable
    /// cart, a disallowed carrier, or a total the entries cannot reproduce;
    /// otherwise a pricing or processor error.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn build(
        &self,
        cart_id: &CartId,
        expected_method: Option<&FulfillmentMethodId>,
    ) -> Result<CheckoutSession, CheckoutError> {
        let cart = self.pricing.get_cart_total(cart_id).await?;

        if cart.completed {
            return Err(CheckoutError::AlreadyCompleted);
        }
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let method = cart
            .fulfillment
            .as_ref()
            .ok_or(CheckoutError::NoFulfillment)?;
        if let Some(expected) = expected_method.filter(|expected| *expected != &method.id) {
            return Err(CheckoutError::FulfillmentMismatch {
                expected: expected.clone(),
            });
        }
        if !method.carrier.is_allowed(&self.allowed_carriers) {
            warn!(carrier = %method.carrier, "Refusing checkout with disallowed carrier");
            return Err(CheckoutError::CarrierNotAllowed(method.carrier.clone()));
        }

        let entries = payment_entries(&cart)?;
        let itemized = sum_entries(cart.currency, &entries)?;
        if itemized != cart.total {
            warn!(
                itemized = itemized.minor_units,
                backend = cart.total.minor_units,
                "Cart total cannot be itemized"
            );
            return Err(CheckoutError::TotalMismatch {
                itemized: itemized.minor_units,
                backend: cart.total.minor_units,
            });
        }

        let metadata = SessionMetadata {
            source_cart_id: cart.id.clone(),
            fulfillment_method_id: method.id.clone(),
            carrier: method.carrier.clone(),
        };
        let fingerprint = snapshot_fingerprint(&cart.id, &entries, &metadata);

        let request = CheckoutSessionRequest {
            cart_id: cart.id.clone(),
            currency: cart.currency,
            entries,
            metadata,
            customer_email: cart.email.clone(),
            idempotency_key: format!("checkout:{}:{fingerprint}", cart.id),
        };

        let session = self.payments.create_checkout_session(&request).await?;
        info!(
            session_id = %session.id(),
            total = session.total().minor_units,
            "Checkout session ready"
        );
        Ok(session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use redline_core::{
        CurrencyCode, FulfillmentMethod, LineItem, Money, VariantId,
    };

    use super::*;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, CurrencyCode::USD)
    }

    fn cart() -> PricedCart {
        PricedCart {
            id: CartId::parse("cart_01").unwrap(),
            currency: CurrencyCode::USD,
            email: None,
            items: vec![LineItem {
                variant_id: VariantId::parse("variant_intake").unwrap(),
                title: "Cold Air Intake".to_string(),
                quantity: 2,
                unit_price: usd(5000),
                options: Vec::new(),
            }],
            fulfillment: Some(FulfillmentMethod {
                id: FulfillmentMethodId::parse("sm_01").unwrap(),
                carrier: Carrier::new("ups"),
                service: "ground".to_string(),
                amount: usd(500),
            }),
            subtotal: usd(10000),
            total: usd(10500),
            completed: false,
        }
    }

    #[test]
    fn test_entries_include_shipping() {
        let entries = payment_entries(&cart()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "Shipping (UPS ground)");
        assert_eq!(
            sum_entries(CurrencyCode::USD, &entries).unwrap(),
            usd(10500)
        );
    }

    #[test]
    fn test_entries_require_fulfillment() {
        let mut cart = cart();
        cart.fulfillment = None;
        assert!(matches!(
            payment_entries(&cart),
            Err(CheckoutError::NoFulfillment)
        ));
    }

    #[test]
    fn test_fingerprint_tracks_prices() {
        let cart = cart();
        let metadata = SessionMetadata {
            source_cart_id: cart.id.clone(),
            fulfillment_method_id: FulfillmentMethodId::parse("sm_01").unwrap(),
            carrier: Carrier::new("ups"),
        };
        let entries = payment_entries(&cart).unwrap();
        let first = snapshot_fingerprint(&cart.id, &entries, &metadata);
        assert_eq!(first, snapshot_fingerprint(&cart.id, &entries, &metadata));
        assert_eq!(first.len(), 64);

        let mut repriced = entries;
        repriced[0].unit_amount = usd(4500);
        assert_ne!(first, snapshot_fingerprint(&cart.id, &repriced, &metadata));
    }
}
