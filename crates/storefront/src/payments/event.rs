//! Classification of verified webhook bodies.

use std::collections::BTreeMap;
use std::str::FromStr;

use redline_core::{
    CurrencyCode, Money, PaymentEvent, PaymentEventId, PaymentEventKind, PaymentReference,
    PaymentSucceeded,
};
use serde::Deserialize;
use serde_json::Value;

use super::PaymentError;

/// Event types that mean money was captured.
const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

fn malformed(what: impl Into<String>) -> PaymentError {
    PaymentError::MalformedEvent(what.into())
}

/// Parse a verified webhook body.
///
/// Event types outside the success set, and completed sessions that are not
/// yet paid, come back as [`PaymentEventKind::Ignored`].
///
/// # Errors
///
/// Returns `MalformedEvent` if the envelope cannot be read, or if a success
/// event lacks an amount, currency or payment reference.
pub fn parse_event(payload: &[u8]) -> Result<PaymentEvent, PaymentError> {
    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|e| malformed(e.to_string()))?;
    let id = PaymentEventId::parse(&envelope.id).map_err(|e| malformed(e.to_string()))?;
    let object = &envelope.data.object;

    let succeeded = match envelope.event_type.as_str() {
        PAYMENT_SUCCEEDED | PAYMENT_INTENT_SUCCEEDED => true,
        CHECKOUT_SESSION_COMPLETED => {
            object.get("payment_status").and_then(Value::as_str) == Some("paid")
        }
        _ => false,
    };

    let kind = if succeeded {
        PaymentEventKind::Succeeded(read_success(object)?)
    } else {
        PaymentEventKind::Ignored
    };

    Ok(PaymentEvent {
        id,
        event_type: envelope.event_type,
        kind,
    })
}

fn read_success(object: &Value) -> Result<PaymentSucceeded, PaymentError> {
    let currency = object
        .get("currency")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("success event without currency"))?;
    let currency = CurrencyCode::from_str(currency).map_err(|e| malformed(e.to_string()))?;

    let minor_units = ["amount_received", "amount_total", "amount"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_i64))
        .ok_or_else(|| malformed("success event without captured amount"))?;
    if minor_units < 0 {
        return Err(malformed("negative captured amount"));
    }

    let reference = object
        .get("payment_intent")
        .and_then(|intent| intent.as_str().or_else(|| intent.get("id")?.as_str()))
        .or_else(|| object.get("id").and_then(Value::as_str))
        .ok_or_else(|| malformed("success event without payment reference"))?;
    let payment_reference =
        PaymentReference::parse(reference).map_err(|e| malformed(e.to_string()))?;

    let metadata = object
        .get("metadata")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Ok(PaymentSucceeded {
        payment_reference,
        amount_captured: Money::from_minor(minor_units, currency),
        metadata,
    })
}
