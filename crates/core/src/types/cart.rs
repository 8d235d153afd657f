//! Cart types: the authoritative priced cart and the client-side cache.
//!
//! A cart has two shapes in this system:
//!
//! - [`PricedCart`] is what the commerce backend reports *right now*. Its
//!   totals are the only numbers allowed to feed a payment session or an
//!   amount check.
//! - [`CachedCart`] is the copy a browser keeps between page loads so the UI
//!   can render quickly. It is tagged [`NonAuthoritative`] and exposes no way
//!   to turn its display prices into a transaction amount; checkout accepts a
//!   cart id and nothing else.

use core::fmt;

use serde::{Deserialize, Serialize};

use super::authority::NonAuthoritative;
use super::email::Email;
use super::id::{CartId, FulfillmentMethodId, VariantId};
use super::price::{CurrencyCode, Money, MoneyError};

/// A product option chosen by the customer (e.g. "Finish: Gloss Black").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedOption {
    /// Option name.
    pub name: String,
    /// Option value.
    pub value: String,
}

/// A line in the authoritative cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product variant reference.
    pub variant_id: VariantId,
    /// Title shown to the customer and on the payment page.
    pub title: String,
    /// Quantity, always at least 1.
    pub quantity: u32,
    /// Current unit price from the commerce backend.
    pub unit_price: Money,
    /// Free-text option selections.
    #[serde(default)]
    pub options: Vec<SelectedOption>,
}

impl LineItem {
    /// Unit price multiplied by quantity.
    ///
    /// # Errors
    ///
    /// Returns `MoneyError::Overflow` if the product does not fit.
    pub fn line_total(&self) -> Result<Money, MoneyError> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// A shipping carrier identifier, normalized to lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Carrier(String);

impl Carrier {
    /// Create a carrier identifier (trimmed, lower-cased).
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    /// Get the normalized identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the carrier name is empty after normalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this carrier appears in `allowed`.
    #[must_use]
    pub fn is_allowed(&self, allowed: &[Self]) -> bool {
        !self.is_empty() && allowed.contains(self)
    }
}

impl From<String> for Carrier {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<Carrier> for String {
    fn from(carrier: Carrier) -> Self {
        carrier.0
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The shipping method attached to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentMethod {
    /// Commerce-backend identifier of the method (or option) selected.
    pub id: FulfillmentMethodId,
    /// Carrier providing the service.
    pub carrier: Carrier,
    /// Carrier service level (e.g. "ground").
    pub service: String,
    /// Computed shipping amount.
    pub amount: Money,
}

/// A cart as currently priced by the commerce backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedCart {
    /// Commerce-backend cart ID.
    pub id: CartId,
    /// Cart currency.
    pub currency: CurrencyCode,
    /// Customer email, if the cart has one.
    pub email: Option<Email>,
    /// Line items in display order.
    pub items: Vec<LineItem>,
    /// Attached shipping method, if any.
    pub fulfillment: Option<FulfillmentMethod>,
    /// Items subtotal as computed by the backend.
    pub subtotal: Money,
    /// Grand total as computed by the backend.
    pub total: Money,
    /// Whether the backend has already converted this cart into an order.
    pub completed: bool,
}

impl PricedCart {
    /// Whether the cart has no line items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    /// Sum of `unit_price * quantity` over all lines.
    ///
    /// # Errors
    ///
    /// Returns an error on overflow or if a line is priced in another currency.
    pub fn items_total(&self) -> Result<Money, MoneyError> {
        self.items
            .iter()
            .try_fold(Money::zero(self.currency), |acc, item| {
                acc.checked_add(item.line_total()?)
            })
    }

    /// Items total plus the attached fulfillment amount.
    ///
    /// This is the amount a payment session built from this cart charges.
    ///
    /// # Errors
    ///
    /// Returns an error on overflow or currency mismatch.
    pub fn itemized_total(&self) -> Result<Money, MoneyError> {
        let items = self.items_total()?;
        match &self.fulfillment {
            Some(method) => items.checked_add(method.amount),
            None => Ok(items),
        }
    }
}

/// A line in the client-side cart cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLine {
    /// Product variant reference.
    pub variant_id: VariantId,
    /// Display title.
    pub title: String,
    /// Quantity, at least 1.
    pub quantity: u32,
    /// Unit price as it was when the item was added. Display only.
    pub display_unit_price: Money,
    /// Option selections.
    #[serde(default)]
    pub options: Vec<SelectedOption>,
}

impl CachedLine {
    fn same_item(&self, variant_id: &VariantId, options: &[SelectedOption]) -> bool {
        &self.variant_id == variant_id && self.options == options
    }
}

/// Client-held cart cache.
///
/// A pure read cache for rendering: it remembers which commerce-backend cart
/// the browser is working on and what the lines looked like when added. It
/// is re-validated against the pricing authority at every checkout and its
/// prices never leave the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCart {
    /// Commerce-backend cart this cache mirrors, once one exists.
    pub cart_id: Option<CartId>,
    #[serde(default)]
    lines: Vec<CachedLine>,
    #[serde(default)]
    authoritative: NonAuthoritative,
}

impl CachedCart {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache bound to a backend cart.
    #[must_use]
    pub fn for_cart(cart_id: CartId) -> Self {
        Self {
            cart_id: Some(cart_id),
            ..Self::default()
        }
    }

    /// Always `false`: the cache is never a source of truth.
    #[must_use]
    pub const fn is_authoritative(&self) -> bool {
        self.authoritative.is_authoritative()
    }

    /// Cached lines in insertion order.
    #[must_use]
    pub fn lines(&self) -> &[CachedLine] {
        &self.lines
    }

    /// Add a line, merging with an existing line for the same variant and options.
    ///
    /// A zero quantity is ignored.
    pub fn add(&mut self, line: CachedLine) {
        if line.quantity == 0 {
            return;
        }
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| l.same_item(&line.variant_id, &line.options))
        {
            existing.quantity = existing.quantity.saturating_add(line.quantity);
            existing.display_unit_price = line.display_unit_price;
            existing.title = line.title;
        } else {
            self.lines.push(line);
        }
    }

    /// Set the quantity of a line. A quantity of zero removes it.
    ///
    /// Returns `false` if no matching line exists.
    pub fn set_quantity(
        &mut self,
        variant_id: &VariantId,
        options: &[SelectedOption],
        quantity: u32,
    ) -> bool {
        if quantity == 0 {
            return self.remove(variant_id, options);
        }
        match self
            .lines
            .iter_mut()
            .find(|l| l.same_item(variant_id, options))
        {
            Some(line) => {
                line.quantity = quantity;
                true
            }
            None => false,
        }
    }

    /// Remove a line. Returns `false` if no matching line exists.
    pub fn remove(&mut self, variant_id: &VariantId, options: &[SelectedOption]) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| !l.same_item(variant_id, options));
        self.lines.len() != before
    }

    /// Variant identities and quantities, the only thing the pricing
    /// authority ever needs from the cache.
    #[must_use]
    pub fn item_identities(&self) -> Vec<(VariantId, u32)> {
        self.lines
            .iter()
            .map(|l| (l.variant_id.clone(), l.quantity))
            .collect()
    }

    /// Total number of cached units.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }

    /// Display-only subtotal.
    ///
    /// Returns `None` for an empty cache, mixed currencies or overflow.
    #[must_use]
    pub fn display_subtotal(&self) -> Option<Money> {
        let first = self.lines.first()?;
        self.lines
            .iter()
            .try_fold(Money::zero(first.display_unit_price.currency), |acc, l| {
                acc.checked_add(l.display_unit_price.checked_mul(l.quantity).ok()?)
                    .ok()
            })
    }

    /// Forget all lines and the cart binding (after a completed checkout).
    pub fn clear(&mut self) {
        self.cart_id = None;
        self.lines.clear();
    }
}
