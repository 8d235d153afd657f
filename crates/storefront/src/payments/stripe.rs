//! Stripe Checkout Sessions client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use redline_core::{CheckoutSession, CheckoutSessionId};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info, instrument};

use super::{CheckoutSessionRequest, PaymentError, PaymentProcessor};
use crate::config::StripeConfig;

/// Client for the Stripe REST API.
#[derive(Clone)]
pub struct StripeClient {
    inner: Arc<StripeClientInner>,
}

struct StripeClientInner {
    client: reqwest::Client,
    api_base: String,
    secret_key: SecretString,
    success_url: String,
    cancel_url: String,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("api_base", &self.inner.api_base)
            .field("secret_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Flatten a session request into Stripe's bracketed form encoding.
fn session_form(
    request: &CheckoutSessionRequest,
    success_url: &str,
    cancel_url: &str,
) -> Vec<(String, String)> {
    let currency = request.currency.lowercase();
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), success_url.to_string()),
        ("cancel_url".to_string(), cancel_url.to_string()),
        (
            "client_reference_id".to_string(),
            request.cart_id.to_string(),
        ),
    ];

    if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.to_string()));
    }

    for (n, entry) in request.entries.iter().enumerate() {
        let prefix = format!("line_items[{n}]");
        form.push((
            format!("{prefix}[price_data][currency]"),
            currency.clone(),
        ));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            entry.unit_amount.minor_units.to_string(),
        ));
        form.push((
            format!("{prefix}[price_data][product_data][name]"),
            entry.name.clone(),
        ));
        form.push((format!("{prefix}[quantity]"), entry.quantity.to_string()));
    }

    for (key, value) in request.metadata.to_pairs() {
        form.push((format!("metadata[{key}]"), value.clone()));
        form.push((format!("payment_intent_data[metadata][{key}]"), value));
    }

    form
}

impl StripeClient {
    /// Create a new Stripe client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &StripeConfig, timeout: Duration) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            inner: Arc::new(StripeClientInner {
                client,
                api_base: config.api_base.trim_end_matches('/').to_string(),
                secret_key: config.secret_key.clone(),
                success_url: config.success_url.clone(),
                cancel_url: config.cancel_url.clone(),
            }),
        })
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    #[instrument(skip(self, request), fields(cart_id = %request.cart_id))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let form = session_form(request, &self.inner.success_url, &self.inner.cancel_url);

        let response = self
            .inner
            .client
            .post(format!("{}/v1/checkout/sessions", self.inner.api_base))
            .bearer_auth(self.inner.secret_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PaymentError::RateLimited);
        }

        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or_else(|| body.chars().take(200).collect());
            error!(
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "Payment processor rejected checkout session"
            );
            return Err(PaymentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let session: SessionResponse = serde_json::from_str(&body).map_err(|e| {
            error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse checkout session response"
            );
            PaymentError::InvalidResponse(e.to_string())
        })?;

        let id = CheckoutSessionId::parse(&session.id)
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;
        let url = session
            .url
            .ok_or_else(|| PaymentError::InvalidResponse("session without url".to_string()))?;
        let expires_at = session
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        let checkout = CheckoutSession::new(
            id,
            url,
            request.currency,
            request.metadata.clone(),
            request.entries.clone(),
            expires_at,
        )
        .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;

        info!(
            session_id = %checkout.id(),
            total = checkout.total().minor_units,
            "Created checkout session"
        );

        Ok(checkout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use redline_core::{
        CartId, Carrier, CurrencyCode, FulfillmentMethodId, Money, PaymentLineEntry,
        SessionMetadata,
    };
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request() -> CheckoutSessionRequest {
        let usd = |minor| Money::from_minor(minor, CurrencyCode::USD);
        CheckoutSessionRequest {
            cart_id: CartId::parse("cart_01").unwrap(),
            currency: CurrencyCode::USD,
            entries: vec![
                PaymentLineEntry {
                    name: "Cold Air Intake".to_string(),
                    unit_amount: usd(6000),
                    quantity: 1,
                },
                PaymentLineEntry {
                    name: "Iridium Spark Plug".to_string(),
                    unit_amount: usd(2000),
                    quantity: 2,
                },
                PaymentLineEntry {
                    name: "Shipping: ups ground".to_string(),
                    unit_amount: usd(500),
                    quantity: 1,
                },
            ],
            metadata: SessionMetadata {
                source_cart_id: CartId::parse("cart_01").unwrap(),
                fulfillment_method_id: FulfillmentMethodId::parse("sm_01").unwrap(),
                carrier: Carrier::new("ups"),
            },
            customer_email: None,
            idempotency_key: "checkout:cart_01:abc".to_string(),
        }
    }

    fn config(api_base: String) -> StripeConfig {
        StripeConfig {
            api_base,
            secret_key: SecretString::from("sk_test_51Nq8ZxK2vR7mT4pLw9Yb3Hc"),
            webhook_secret: SecretString::from("whsec_Jf83kLq0Zp7Xv2Rm5Tn9Bc4Wd"),
            webhook_tolerance: Duration::from_secs(300),
            success_url: "https://redline.shop/checkout/success".to_string(),
            cancel_url: "https://redline.shop/cart".to_string(),
        }
    }

    #[test]
    fn test_session_form_layout() {
        let form = session_form(&request(), "https://s", "https://c");
        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("client_reference_id"), Some("cart_01"));
        assert_eq!(get("line_items[1][price_data][unit_amount]"), Some("2000"));
        assert_eq!(get("line_items[1][quantity]"), Some("2"));
        assert_eq!(get("line_items[2][price_data][currency]"), Some("usd"));
        assert_eq!(get("metadata[source_cart_id]"), Some("cart_01"));
        assert_eq!(
            get("payment_intent_data[metadata][fulfillment_method_id]"),
            Some("sm_01")
        );
        assert_eq!(get("metadata[carrier]"), Some("ups"));
        assert_eq!(get("customer_email"), None);
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("Idempotency-Key", "checkout:cart_01:abc"))
            .and(header(
                "authorization",
                "Bearer sk_test_51Nq8ZxK2vR7mT4pLw9Yb3Hc",
            ))
            .and(body_string_contains("client_reference_id=cart_01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1",
                "expires_at": 1_700_086_400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = StripeClient::new(&config(server.uri()), Duration::from_secs(5)).unwrap();
        let session = client.create_checkout_session(&request()).await.unwrap();

        assert_eq!(session.id().as_str(), "cs_test_1");
        assert_eq!(session.total().minor_units, 10500);
        assert_eq!(session.source_cart_id().as_str(), "cart_01");
        assert!(session.expires_at().is_some());
    }

    #[tokio::test]
    async fn test_processor_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "message": "Invalid currency", "type": "invalid_request_error" }
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(&config(server.uri()), Duration::from_secs(5)).unwrap();
        let err = client.create_checkout_session(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Api { status: 400, ref message } if message == "Invalid currency"
        ));
    }
}
