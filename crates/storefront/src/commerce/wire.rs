//! Wire formats of the commerce backend's store API and their conversion
//! into domain types.
//!
//! Amounts arrive as JSON numbers in major units. They are read as
//! [`serde_json::Number`] and converted exactly; a value with a fraction of
//! a minor unit is a data error.

use std::collections::BTreeMap;
use std::str::FromStr;

use redline_core::{
    CartId, Carrier, CurrencyCode, Email, FulfillmentMethod, FulfillmentMethodId, LineItem, Money,
    OrderId, PricedCart, SelectedOption, VariantId,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Number;

use super::{CommerceError, CompletedOrder, FulfillmentOption};

#[derive(Debug, Deserialize)]
pub(super) struct CartEnvelope {
    pub cart: WireCart,
}

#[derive(Debug, Deserialize)]
pub(super) struct WireCart {
    id: String,
    currency_code: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    items: Vec<WireLineItem>,
    #[serde(default)]
    shipping_methods: Vec<WireShippingMethod>,
    #[serde(default)]
    subtotal: Option<Number>,
    total: Number,
}

#[derive(Debug, Deserialize)]
struct WireLineItem {
    #[serde(default)]
    variant_id: Option<String>,
    title: String,
    #[serde(default)]
    product_title: Option<String>,
    quantity: u32,
    unit_price: Number,
    #[serde(default)]
    variant_option_values: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct WireShippingMethod {
    id: String,
    #[serde(default)]
    shipping_option_id: Option<String>,
    amount: Number,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: WireShippingData,
}

#[derive(Debug, Default, Deserialize)]
struct WireShippingData {
    #[serde(default)]
    carrier: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ShippingOptionsEnvelope {
    pub shipping_options: Vec<WireShippingOption>,
}

#[derive(Debug, Deserialize)]
pub(super) struct WireShippingOption {
    id: String,
    name: String,
    amount: Number,
    #[serde(default)]
    data: WireShippingData,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum CompleteResponse {
    Order { order: WireOrder },
    Cart {
        #[serde(default)]
        error: Option<WireCompletionError>,
    },
}

#[derive(Debug, Deserialize)]
pub(super) struct WireOrder {
    id: String,
    #[serde(default)]
    total: Option<Number>,
    #[serde(default)]
    currency_code: Option<String>,
}

impl WireOrder {
    /// An order known only by id (from a conflict answer).
    pub const fn with_id(id: String) -> Self {
        Self {
            id,
            total: None,
            currency_code: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct WireCompletionError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a 409 answer to a completion request.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ConflictBody {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    order: Option<ConflictOrder>,
}

#[derive(Debug, Deserialize)]
struct ConflictOrder {
    id: String,
}

impl ConflictBody {
    pub fn existing_order_id(self) -> Option<String> {
        self.order_id.or(self.order.map(|o| o.id))
    }
}

fn invalid(what: impl std::fmt::Display) -> CommerceError {
    CommerceError::InvalidResponse(what.to_string())
}

/// Convert a major-unit JSON number into exact minor units.
pub(super) fn to_money(value: &Number, currency: CurrencyCode) -> Result<Money, CommerceError> {
    let text = value.to_string();
    let decimal = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| invalid(format!("amount {text}: {e}")))?;
    let money = Money::from_decimal(decimal, currency).map_err(invalid)?;
    if money.is_negative() {
        return Err(invalid(format!("negative amount {text}")));
    }
    Ok(money)
}

fn parse_currency(code: &str) -> Result<CurrencyCode, CommerceError> {
    CurrencyCode::from_str(code).map_err(invalid)
}

fn carrier_of(data: &WireShippingData) -> Carrier {
    Carrier::new(data.carrier.as_deref().unwrap_or_default())
}

impl WireCart {
    pub fn into_priced_cart(self) -> Result<PricedCart, CommerceError> {
        let currency = parse_currency(&self.currency_code)?;
        let id = CartId::parse(&self.id).map_err(invalid)?;

        let items = self
            .items
            .into_iter()
            .map(|item| item.into_line_item(currency))
            .collect::<Result<Vec<_>, _>>()?;

        let fulfillment = self
            .shipping_methods
            .into_iter()
            .last()
            .map(|method| -> Result<FulfillmentMethod, CommerceError> {
                Ok(FulfillmentMethod {
                    id: FulfillmentMethodId::parse(
                        method.shipping_option_id.as_deref().unwrap_or(&method.id),
                    )
                    .map_err(invalid)?,
                    carrier: carrier_of(&method.data),
                    service: method
                        .data
                        .service
                        .clone()
                        .or(method.name)
                        .unwrap_or_default(),
                    amount: to_money(&method.amount, currency)?,
                })
            })
            .transpose()?;

        let total = to_money(&self.total, currency)?;
        let subtotal = match &self.subtotal {
            Some(value) => to_money(value, currency)?,
            None => items
                .iter()
                .try_fold(Money::zero(currency), |acc, item| {
                    acc.checked_add(item.line_total()?)
                })
                .map_err(invalid)?,
        };

        Ok(PricedCart {
            id,
            currency,
            email: self.email.as_deref().and_then(|e| Email::parse(e).ok()),
            items,
            fulfillment,
            subtotal,
            total,
            completed: self.completed_at.is_some(),
        })
    }
}

impl WireLineItem {
    fn into_line_item(self, currency: CurrencyCode) -> Result<LineItem, CommerceError> {
        if self.quantity == 0 {
            return Err(invalid("line item with zero quantity"));
        }
        let variant_id = self
            .variant_id
            .as_deref()
            .ok_or_else(|| invalid("line item without variant"))
            .and_then(|v| VariantId::parse(v).map_err(invalid))?;
        let title = match self.product_title {
            Some(product) if product != self.title => format!("{product} - {}", self.title),
            _ => self.title,
        };
        let options = self
            .variant_option_values
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| SelectedOption { name, value })
            .collect();

        Ok(LineItem {
            variant_id,
            title,
            quantity: self.quantity,
            unit_price: to_money(&self.unit_price, currency)?,
            options,
        })
    }
}

impl WireShippingOption {
    pub fn into_option(self, currency: CurrencyCode) -> Result<FulfillmentOption, CommerceError> {
        Ok(FulfillmentOption {
            id: FulfillmentMethodId::parse(&self.id).map_err(invalid)?,
            carrier: carrier_of(&self.data),
            service: self.data.service.clone().unwrap_or_default(),
            amount: to_money(&self.amount, currency)?,
            name: self.name,
        })
    }
}

impl WireOrder {
    pub fn into_completed(
        self,
        fallback_currency: CurrencyCode,
        already_completed: bool,
    ) -> Result<CompletedOrder, CommerceError> {
        let currency = match self.currency_code.as_deref() {
            Some(code) => parse_currency(code)?,
            None => fallback_currency,
        };
        Ok(CompletedOrder {
            order_id: OrderId::parse(&self.id).map_err(invalid)?,
            total: self
                .total
                .as_ref()
                .map(|t| to_money(t, currency))
                .transpose()?,
            already_completed,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cart_json() -> serde_json::Value {
        serde_json::json!({
            "cart": {
                "id": "cart_01",
                "currency_code": "usd",
                "email": "Driver@Example.com",
                "items": [
                    {
                        "id": "item_1",
                        "variant_id": "variant_intake",
                        "title": "Black",
                        "product_title": "Cold Air Intake",
                        "quantity": 1,
                        "unit_price": 60,
                        "variant_option_values": { "Finish": "Black" }
                    },
                    {
                        "id": "item_2",
                        "variant_id": "variant_plugs",
                        "title": "Iridium Spark Plug",
                        "quantity": 2,
                        "unit_price": 20.00
                    }
                ],
                "shipping_methods": [
                    {
                        "id": "sm_01",
                        "shipping_option_id": "so_ups",
                        "name": "UPS Ground",
                        "amount": 5,
                        "data": { "carrier": "UPS", "service": "ground" }
                    }
                ],
                "subtotal": 100,
                "shipping_total": 5,
                "total": 105
            }
        })
    }

    #[test]
    fn test_cart_conversion() {
        let envelope: CartEnvelope = serde_json::from_value(cart_json()).unwrap();
        let cart = envelope.cart.into_priced_cart().unwrap();

        assert_eq!(cart.currency, CurrencyCode::USD);
        assert_eq!(cart.total.minor_units, 10500);
        assert_eq!(cart.subtotal.minor_units, 10000);
        assert_eq!(cart.items.len(), 2);
        assert_eq!(cart.items[0].title, "Cold Air Intake - Black");
        assert_eq!(cart.items[0].options.len(), 1);
        assert_eq!(cart.items[1].unit_price.minor_units, 2000);
        let method = cart.fulfillment.unwrap();
        assert_eq!(method.id.as_str(), "so_ups");
        assert_eq!(method.carrier.as_str(), "ups");
        assert_eq!(method.amount.minor_units, 500);
        assert_eq!(cart.email.unwrap().as_str(), "driver@example.com");
        assert!(!cart.completed);
    }

    #[test]
    fn test_sub_minor_amount_is_rejected() {
        let mut json = cart_json();
        json["cart"]["total"] = serde_json::json!(105.005);
        let envelope: CartEnvelope = serde_json::from_value(json).unwrap();
        assert!(matches!(
            envelope.cart.into_priced_cart(),
            Err(CommerceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_missing_carrier_is_empty() {
        let mut json = cart_json();
        json["cart"]["shipping_methods"][0]["data"] = serde_json::json!({});
        let envelope: CartEnvelope = serde_json::from_value(json).unwrap();
        let cart = envelope.cart.into_priced_cart().unwrap();
        assert!(cart.fulfillment.unwrap().carrier.is_empty());
    }

    #[test]
    fn test_complete_response_variants() {
        let order: CompleteResponse = serde_json::from_value(serde_json::json!({
            "type": "order",
            "order": { "id": "order_1", "total": 105, "currency_code": "usd" }
        }))
        .unwrap();
        assert!(matches!(order, CompleteResponse::Order { .. }));

        let failed: CompleteResponse = serde_json::from_value(serde_json::json!({
            "type": "cart",
            "cart": { "id": "cart_01" },
            "error": { "message": "Payment not authorized", "type": "payment_authorization_error" }
        }))
        .unwrap();
        assert!(matches!(failed, CompleteResponse::Cart { error: Some(_) }));
    }

    #[test]
    fn test_conflict_body_order_id() {
        let body: ConflictBody =
            serde_json::from_value(serde_json::json!({ "order": { "id": "order_1" } })).unwrap();
        assert_eq!(body.existing_order_id().as_deref(), Some("order_1"));

        let body: ConflictBody =
            serde_json::from_value(serde_json::json!({ "message": "in progress" })).unwrap();
        assert_eq!(body.existing_order_id(), None);
    }
}
