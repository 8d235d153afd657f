//! Payment processor webhook.
//!
//! The body is taken as raw bytes: the signature covers the exact bytes the
//! processor sent, so it must be verified before any JSON parsing.

use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, instrument, warn};

use crate::error::Result;
use crate::payments::SIGNATURE_HEADER;
use crate::state::AppState;

/// Receive a payment event.
///
/// Answers with a bare acknowledgment; diagnostics stay in the logs. Only an
/// untrusted body (4xx) or a retryable failure (409, 5xx) is refused, so the
/// processor redelivers exactly the events that can still succeed.
#[instrument(skip_all, fields(body_len = body.len()))]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.receiver().receive(&body, signature, Utc::now()).await {
        Ok(_) => {}
        Err(e) if e.is_permanent() => {
            if e.needs_alert() {
                let sentry_event_id = sentry::capture_error(&e);
                error!(
                    error = %e,
                    sentry_event_id = %sentry_event_id,
                    "Webhook cannot be processed, acknowledging"
                );
            } else {
                warn!(error = %e, "Payment parked for manual review, acknowledging");
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Json(json!({ "received": true })))
}
