//! Klaviyo events API client.
//!
//! Publishes quote and order events against a customer profile so flows
//! configured in Klaviyo send the actual emails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, error, instrument};

use super::notify::{Notification, Notifier, NotifyError};
use crate::config::KlaviyoConfig;

/// Klaviyo API version.
const API_REVISION: &str = "2024-10-15";

/// Klaviyo API base URL.
const BASE_URL: &str = "https://a.klaviyo.com";

/// Klaviyo API client for event tracking.
#[derive(Clone)]
pub struct KlaviyoClient {
    inner: Arc<KlaviyoClientInner>,
}

struct KlaviyoClientInner {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for KlaviyoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlaviyoClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl KlaviyoClient {
    /// Create a new Klaviyo API client.
    ///
    /// # Errors
    ///
    /// Returns error if the API key is not a valid header value or the HTTP
    /// client fails to build.
    pub fn new(config: &KlaviyoConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let mut headers = HeaderMap::new();

        let auth_value = format!("Klaviyo-API-Key {}", config.api_key.expose_secret());
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&auth_value)
                .map_err(|e| NotifyError::Config(format!("Invalid API key format: {e}")))?,
        );
        headers.insert("revision", HeaderValue::from_static(API_REVISION));
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/vnd.api+json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(KlaviyoClientInner {
                client,
                base_url: config
                    .api_base
                    .as_deref()
                    .unwrap_or(BASE_URL)
                    .trim_end_matches('/')
                    .to_string(),
            }),
        })
    }

    /// Record a metric event for the profile identified by `email`.
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails.
    pub async fn track_event(
        &self,
        metric: &str,
        email: &str,
        unique_id: &str,
        properties: Value,
        value: Option<f64>,
    ) -> Result<(), NotifyError> {
        let mut attributes = json!({
            "properties": properties,
            "unique_id": unique_id,
            "metric": {
                "data": { "type": "metric", "attributes": { "name": metric } }
            },
            "profile": {
                "data": { "type": "profile", "attributes": { "email": email } }
            }
        });
        if let (Some(value), Some(map)) = (value, attributes.as_object_mut()) {
            map.insert("value".to_string(), json!(value));
        }

        let response = self
            .inner
            .client
            .post(format!("{}/api/events", self.inner.base_url))
            .json(&json!({ "data": { "type": "event", "attributes": attributes } }))
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!(
                status = %status,
                body = %message.chars().take(500).collect::<String>(),
                "Klaviyo rejected event"
            );
            return Err(NotifyError::Api {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        debug!(metric, "Klaviyo event accepted");
        Ok(())
    }
}

#[async_trait]
impl Notifier for KlaviyoClient {
    #[instrument(skip(self, notification), fields(metric = notification.metric()))]
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification {
            Notification::QuoteSubmitted {
                id,
                kind,
                name,
                email,
            } => {
                self.track_event(
                    notification.metric(),
                    email.as_str(),
                    &id.to_string(),
                    json!({ "request_id": id.to_string(), "kind": kind, "name": name }),
                    None,
                )
                .await
            }
            Notification::OrderPlaced {
                order_id,
                cart_id,
                email,
                total,
            } => {
                let value = total.to_decimal().to_string().parse::<f64>().ok();
                self.track_event(
                    notification.metric(),
                    email.as_str(),
                    order_id.as_str(),
                    json!({
                        "order_id": order_id,
                        "cart_id": cart_id,
                        "currency": total.currency.code(),
                        "total_minor_units": total.minor_units,
                    }),
                    value,
                )
                .await
            }
        }
    }
}
