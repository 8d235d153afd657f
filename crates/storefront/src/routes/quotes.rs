//! Quote and wholesale request intake.

use axum::{Json, extract::State, http::StatusCode};
use redline_core::NewQuoteRequest;
use serde::Serialize;
use tracing::instrument;

use crate::error::Result;
use crate::state::AppState;

/// Acknowledgment for a stored request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuoteAccepted {
    pub id: String,
}

/// Submit a quote, wheel-spec or wholesale request.
#[instrument(skip_all, fields(kind = %request.kind))]
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<NewQuoteRequest>,
) -> Result<(StatusCode, Json<QuoteAccepted>)> {
    let id = state.quotes().submit(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(QuoteAccepted { id: id.to_string() }),
    ))
}
