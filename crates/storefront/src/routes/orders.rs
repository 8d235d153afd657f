//! Order confirmation.
//!
//! Answers from the event ledger only, never from the content-store mirror.

use axum::{
    Json,
    extract::{Path, State},
};
use redline_core::{CartId, EventStatus};
use serde::Serialize;
use tracing::instrument;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// What the customer is told after paying.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    /// Payment received, order confirmed.
    Confirmed { order_id: String },
    /// We will follow up.
    Pending,
}

/// Order status for a cart that went through checkout.
#[instrument(skip(state))]
pub async fn confirmation(
    State(state): State<AppState>,
    Path(cart_id): Path<String>,
) -> Result<Json<Confirmation>> {
    let cart_id = CartId::parse(&cart_id).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let confirmation = state
        .ledger()
        .find_by_cart(&cart_id)
        .await?
        .filter(|entry| entry.status == EventStatus::Completed)
        .and_then(|entry| entry.order_id)
        .map_or(Confirmation::Pending, |order_id| Confirmation::Confirmed {
            order_id: order_id.into_inner(),
        });

    Ok(Json(confirmation))
}
