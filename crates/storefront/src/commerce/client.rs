//! REST client for the commerce backend's store API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redline_core::{CartId, CurrencyCode, FulfillmentMethodId, PaymentReference, PricedCart};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument, warn};

use super::wire::{
    CartEnvelope, CompleteResponse, ConflictBody, ShippingOptionsEnvelope, WireOrder,
};
use super::{CommerceBackend, CommerceError, CompletedOrder, FulfillmentOption};
use crate::config::CommerceConfig;

/// Header carrying the publishable key.
const PUBLISHABLE_KEY_HEADER: &str = "x-publishable-api-key";

/// Client for the commerce backend's store API.
///
/// Every call goes to the backend; there is deliberately no cache in front
/// of prices.
#[derive(Clone)]
pub struct CommerceClient {
    inner: Arc<CommerceClientInner>,
}

struct CommerceClientInner {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for CommerceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommerceClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl CommerceClient {
    /// Create a new commerce backend client.
    ///
    /// # Errors
    ///
    /// Returns error if the key is not a valid header value or the HTTP
    /// client fails to build.
    pub fn new(config: &CommerceConfig, timeout: Duration) -> Result<Self, CommerceError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            PUBLISHABLE_KEY_HEADER,
            HeaderValue::from_str(&config.publishable_key).map_err(|e| {
                CommerceError::InvalidResponse(format!("Invalid publishable key format: {e}"))
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(CommerceClientInner {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
            }),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.base_url)
    }

    /// Map non-success statuses to errors and parse the body.
    async fn parse<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, CommerceError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CommerceError::RateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(CommerceError::NotFound(what.to_string()));
        }

        let body = response.text().await?;

        if !status.is_success() {
            error!(
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "Commerce backend returned non-success status"
            );
            return Err(CommerceError::Api {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse commerce backend response"
            );
            CommerceError::InvalidResponse(e.to_string())
        })
    }
}

#[async_trait]
impl CommerceBackend for CommerceClient {
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn get_cart(&self, cart_id: &CartId) -> Result<PricedCart, CommerceError> {
        let response = self
            .inner
            .client
            .get(self.url(&format!("/store/carts/{cart_id}")))
            .send()
            .await?;

        let envelope: CartEnvelope = Self::parse(response, "cart").await?;
        let cart = envelope.cart.into_priced_cart()?;
        debug!(total = cart.total.minor_units, items = cart.items.len(), "Fetched cart");
        Ok(cart)
    }

    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn list_fulfillment_options(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<FulfillmentOption>, CommerceError> {
        let currency = self.get_cart(cart_id).await?.currency;

        let response = self
            .inner
            .client
            .get(self.url("/store/shipping-options"))
            .query(&[("cart_id", cart_id.as_str())])
            .send()
            .await?;

        let envelope: ShippingOptionsEnvelope = Self::parse(response, "shipping options").await?;
        envelope
            .shipping_options
            .into_iter()
            .map(|option| option.into_option(currency))
            .collect()
    }

    #[instrument(skip(self), fields(cart_id = %cart_id, option_id = %option_id))]
    async fn attach_fulfillment(
        &self,
        cart_id: &CartId,
        option_id: &FulfillmentMethodId,
    ) -> Result<PricedCart, CommerceError> {
        let response = self
            .inner
            .client
            .post(self.url(&format!("/store/carts/{cart_id}/shipping-methods")))
            .json(&serde_json::json!({ "option_id": option_id.as_str() }))
            .send()
            .await?;

        let envelope: CartEnvelope = Self::parse(response, "cart").await?;
        envelope.cart.into_priced_cart()
    }

    #[instrument(skip(self), fields(cart_id = %cart_id, payment_reference = %payment_reference))]
    async fn complete_cart(
        &self,
        cart_id: &CartId,
        payment_reference: &PaymentReference,
    ) -> Result<CompletedOrder, CommerceError> {
        let response = self
            .inner
            .client
            .post(self.url(&format!("/store/carts/{cart_id}/complete")))
            .header("Idempotency-Key", format!("complete:{cart_id}"))
            .json(&serde_json::json!({
                "metadata": { "payment_reference": payment_reference.as_str() }
            }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await?;
            let conflict: ConflictBody = serde_json::from_str(&body).unwrap_or_default();
            return match conflict.existing_order_id() {
                Some(order_id) => {
                    warn!(order_id = %order_id, "Cart was already completed");
                    WireOrder::with_id(order_id).into_completed(CurrencyCode::default(), true)
                }
                None => Err(CommerceError::Api {
                    status: StatusCode::CONFLICT.as_u16(),
                    message: body.chars().take(200).collect(),
                }),
            };
        }

        match Self::parse::<CompleteResponse>(response, "cart").await? {
            CompleteResponse::Order { order } => order.into_completed(CurrencyCode::default(), false),
            CompleteResponse::Cart { error } => {
                let message = error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "cart was not completed".to_string());
                error!(message = %message, "Commerce backend refused to complete cart");
                Err(CommerceError::Completion(message))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::services::retry::Transient;

    async fn client_for(server: &MockServer) -> CommerceClient {
        CommerceClient::new(
            &CommerceConfig {
                base_url: server.uri(),
                publishable_key: "pk_test_123".to_string(),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn cart_body(total: f64) -> serde_json::Value {
        serde_json::json!({
            "cart": {
                "id": "cart_01",
                "currency_code": "usd",
                "items": [
                    { "variant_id": "variant_1", "title": "Coilovers", "quantity": 1, "unit_price": 100 }
                ],
                "shipping_methods": [],
                "total": total
            }
        })
    }

    #[tokio::test]
    async fn test_get_cart_sends_publishable_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/store/carts/cart_01"))
            .and(header("x-publishable-api-key", "pk_test_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cart_body(100.0)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let cart = client.get_cart(&CartId::parse("cart_01").unwrap()).await.unwrap();
        assert_eq!(cart.total.minor_units, 10000);
    }

    #[tokio::test]
    async fn test_get_cart_not_found_and_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/store/carts/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store/carts/flaky"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .get_cart(&CartId::parse("missing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::NotFound(_)));
        assert!(!err.is_transient());

        let err = client
            .get_cart(&CartId::parse("flaky").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::Api { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_closed() {
        let client = CommerceClient::new(
            &CommerceConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                publishable_key: "pk_test_123".to_string(),
            },
            Duration::from_millis(500),
        )
        .unwrap();
        let err = client
            .get_cart(&CartId::parse("cart_01").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::Http(_)));
    }

    #[tokio::test]
    async fn test_complete_cart_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/store/carts/cart_01/complete"))
            .and(header("Idempotency-Key", "complete:cart_01"))
            .and(body_json(serde_json::json!({
                "metadata": { "payment_reference": "pi_123" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "order",
                "order": { "id": "order_01", "total": 105, "currency_code": "usd" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let order = client
            .complete_cart(
                &CartId::parse("cart_01").unwrap(),
                &PaymentReference::parse("pi_123").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(order.order_id.as_str(), "order_01");
        assert_eq!(order.total.unwrap().minor_units, 10500);
        assert!(!order.already_completed);
    }

    #[tokio::test]
    async fn test_complete_cart_conflict_is_success_when_order_known() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/store/carts/cart_01/complete"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(serde_json::json!({ "order_id": "order_01" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let order = client
            .complete_cart(
                &CartId::parse("cart_01").unwrap(),
                &PaymentReference::parse("pi_123").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(order.order_id.as_str(), "order_01");
        assert!(order.already_completed);
    }

    #[tokio::test]
    async fn test_complete_cart_refused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/store/carts/cart_01/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "cart",
                "cart": { "id": "cart_01" },
                "error": { "message": "Insufficient inventory" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .complete_cart(
                &CartId::parse("cart_01").unwrap(),
                &PaymentReference::parse("pi_123").unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::Completion(ref m) if m == "Insufficient inventory"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_list_fulfillment_options() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/store/carts/cart_01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cart_body(100.0)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store/shipping-options"))
            .and(query_param("cart_id", "cart_01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "shipping_options": [
                    { "id": "so_ups", "name": "UPS Ground", "amount": 5, "data": { "carrier": "ups", "service": "ground" } },
                    { "id": "so_dhl", "name": "DHL Express", "amount": 25, "data": { "carrier": "dhl", "service": "express" } }
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let options = client
            .list_fulfillment_options(&CartId::parse("cart_01").unwrap())
            .await
            .unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].amount.minor_units, 500);
        assert_eq!(options[1].carrier.as_str(), "dhl");
    }
}
