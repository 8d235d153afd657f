//! Checkout route handlers.
//!
//! Requests carry cart and option ids only. Bodies reject unknown fields, so
//! a client cannot even send a price.

use axum::{
    Json,
    extract::{Query, State},
};
use redline_core::{CartId, CurrencyCode, FulfillmentMethodId, PricedCart};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::commerce::FulfillmentOption;
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Query for the fulfillment options listing.
#[derive(Debug, Deserialize)]
pub struct CartQuery {
    /// Cart to list options for.
    pub cart_id: String,
}

/// A shipping option as shown to the customer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FulfillmentOptionView {
    pub id: String,
    pub name: String,
    pub carrier: String,
    pub service: String,
    pub amount_minor_units: i64,
    pub currency: CurrencyCode,
}

impl From<FulfillmentOption> for FulfillmentOptionView {
    fn from(option: FulfillmentOption) -> Self {
        Self {
            id: option.id.into_inner(),
            name: option.name,
            carrier: option.carrier.as_str().to_string(),
            service: option.service,
            amount_minor_units: option.amount.minor_units,
            currency: option.amount.currency,
        }
    }
}

/// Attach a shipping option to a cart.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectFulfillmentRequest {
    pub cart_id: String,
    pub option_id: String,
}

/// Cart totals after a fulfillment change, straight from the commerce
/// backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CartTotalsView {
    pub cart_id: String,
    pub fulfillment_method_id: Option<String>,
    pub carrier: Option<String>,
    pub subtotal_minor_units: i64,
    pub total_minor_units: i64,
    pub currency: CurrencyCode,
}

impl From<&PricedCart> for CartTotalsView {
    fn from(cart: &PricedCart) -> Self {
        Self {
            cart_id: cart.id.to_string(),
            fulfillment_method_id: cart.fulfillment.as_ref().map(|m| m.id.to_string()),
            carrier: cart
                .fulfillment
                .as_ref()
                .map(|m| m.carrier.as_str().to_string()),
            subtotal_minor_units: cart.subtotal.minor_units,
            total_minor_units: cart.total.minor_units,
            currency: cart.currency,
        }
    }
}

/// Create a payment session for a cart.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    pub cart_id: String,
    /// The method the customer selected; must still be attached.
    #[serde(default)]
    pub fulfillment_method_id: Option<String>,
}

/// Where to send the customer to pay.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: String,
    pub url: String,
    pub total_minor_units: i64,
    pub currency: CurrencyCode,
}

fn parse_cart_id(raw: &str) -> Result<CartId> {
    CartId::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))
}

fn parse_method_id(raw: &str) -> Result<FulfillmentMethodId> {
    FulfillmentMethodId::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))
}

/// List shipping options for a cart, limited to allowed carriers.
#[instrument(skip(state))]
pub async fn fulfillment_options(
    State(state): State<AppState>,
    Query(query): Query<CartQuery>,
) -> Result<Json<Vec<FulfillmentOptionView>>> {
    let cart_id = parse_cart_id(&query.cart_id)?;
    let options = state.checkout().fulfillment_options(&cart_id).await?;
    Ok(Json(options.into_iter().map(Into::into).collect()))
}

/// Attach a shipping option after checking its carrier.
#[instrument(skip(state, request), fields(cart_id = %request.cart_id, option_id = %request.option_id))]
pub async fn select_fulfillment(
    State(state): State<AppState>,
    Json(request): Json<SelectFulfillmentRequest>,
) -> Result<Json<CartTotalsView>> {
    let cart_id = parse_cart_id(&request.cart_id)?;
    let option_id = parse_method_id(&request.option_id)?;
    let cart = state
        .checkout()
        .select_fulfillment(&cart_id, &option_id)
        .await?;
    Ok(Json(CartTotalsView::from(&cart)))
}

/// Build a payment session from the cart's live state.
#[instrument(skip(state, request), fields(cart_id = %request.cart_id))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionView>> {
    let cart_id = parse_cart_id(&request.cart_id)?;
    let expected = request
        .fulfillment_method_id
        .as_deref()
        .map(parse_method_id)
        .transpose()?;

    let session = state.checkout().build(&cart_id, expected.as_ref()).await?;
    Ok(Json(SessionView {
        session_id: session.id().to_string(),
        url: session.url().to_string(),
        total_minor_units: session.total().minor_units,
        currency: session.total().currency,
    }))
}
