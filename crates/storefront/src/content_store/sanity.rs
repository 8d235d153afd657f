//! Sanity HTTP API client.
//!
//! Reads go to the live API host, not the CDN, so a mirror written a moment
//! ago is visible to the next idempotency check.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redline_core::{MirrorOrder, PaymentEventId, PaymentReference, QuoteRequest};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, error, instrument};

use super::{ContentStore, ContentStoreError, MirrorWrite};
use crate::config::SanityConfig;

const MIRROR_TYPE: &str = "orderMirror";
const QUOTE_TYPE: &str = "quoteRequest";

const FIND_MIRROR_QUERY: &str = r#"*[_type == "orderMirror" && (paymentEventId == $eventId || paymentReference == $reference)][0]{
  paymentEventId, paymentReference, orderId, sourceCartId, totalMinorUnits,
  currency, carrier, fulfillmentStatus, createdAt, authoritative
}"#;

/// Client for the Sanity query and mutation APIs.
#[derive(Clone)]
pub struct SanityClient {
    inner: Arc<SanityClientInner>,
}

struct SanityClientInner {
    client: reqwest::Client,
    data_base: String,
    dataset: String,
    token: SecretString,
}

impl std::fmt::Debug for SanityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanityClient")
            .field("data_base", &self.inner.data_base)
            .field("dataset", &self.inner.dataset)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct MutateResponse {
    #[serde(default)]
    results: Vec<MutationResult>,
}

#[derive(Debug, Deserialize)]
struct MutationResult {
    #[serde(default)]
    operation: Option<String>,
}

/// Deterministic document id for the mirror of a payment.
///
/// Document ids allow `[A-Za-z0-9._-]`. A reference made only of those
/// characters is used as is; any other reference is replaced by its SHA-256
/// under a separate prefix, so distinct references never share an id.
#[must_use]
pub fn mirror_document_id(reference: &PaymentReference) -> String {
    let raw = reference.as_str();
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return format!("{MIRROR_TYPE}.{raw}");
    }
    let digest = Sha256::digest(raw.as_bytes());
    format!("{MIRROR_TYPE}-sha256.{}", hex::encode(digest))
}

fn mirror_document(mirror: &MirrorOrder) -> Result<Value, ContentStoreError> {
    let Value::Object(fields) = serde_json::to_value(mirror)
        .map_err(|e| ContentStoreError::InvalidResponse(e.to_string()))?
    else {
        return Err(ContentStoreError::InvalidResponse(
            "mirror did not serialize to an object".to_string(),
        ));
    };

    let mut document = Map::new();
    document.insert(
        "_id".to_string(),
        Value::String(mirror_document_id(&mirror.payment_reference)),
    );
    document.insert("_type".to_string(), Value::String(MIRROR_TYPE.to_string()));
    document.extend(fields.into_iter().filter(|(_, v)| !v.is_null()));
    Ok(Value::Object(document))
}

fn quote_document(request: &QuoteRequest) -> Value {
    let lines: Vec<Value> = request
        .lines
        .iter()
        .enumerate()
        .map(|(n, line)| {
            json!({
                "_key": format!("line-{n}"),
                "description": line.description,
                "quantity": line.quantity,
                "reference": line.reference,
            })
        })
        .collect();

    json!({
        "_id": format!("{QUOTE_TYPE}.{}", request.id),
        "_type": QUOTE_TYPE,
        "kind": request.kind,
        "status": request.status,
        "contact": {
            "name": request.contact.name,
            "email": request.contact.email.as_str(),
            "phone": request.contact.phone,
            "company": request.contact.company,
        },
        "vehicle": request.vehicle,
        "lines": lines,
        "notes": request.notes,
        "submittedAt": request.submitted_at,
    })
}

impl SanityClient {
    /// Create a new content store client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &SanityConfig, timeout: Duration) -> Result<Self, ContentStoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let version = config.api_version.trim_start_matches('v');

        Ok(Self {
            inner: Arc::new(SanityClientInner {
                client,
                data_base: format!("{}/v{version}/data", config.api_base()),
                dataset: config.dataset.clone(),
                token: config.api_token.clone(),
            }),
        })
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ContentStoreError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ContentStoreError::RateLimited);
        }

        let body = response.text().await?;

        if !status.is_success() {
            error!(
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "Content store returned non-success status"
            );
            return Err(ContentStoreError::Api {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse content store response"
            );
            ContentStoreError::InvalidResponse(e.to_string())
        })
    }

    async fn mutate(&self, mutation: Value) -> Result<MutateResponse, ContentStoreError> {
        let response = self
            .inner
            .client
            .post(format!(
                "{}/mutate/{}",
                self.inner.data_base, self.inner.dataset
            ))
            .query(&[("returnIds", "true")])
            .bearer_auth(self.inner.token.expose_secret())
            .json(&json!({ "mutations": [mutation] }))
            .send()
            .await?;

        Self::read(response).await
    }
}

#[async_trait]
impl ContentStore for SanityClient {
    #[instrument(skip(self), fields(event_id = %event_id, payment_reference = %payment_reference))]
    async fn find_mirror(
        &self,
        event_id: &PaymentEventId,
        payment_reference: &PaymentReference,
    ) -> Result<Option<MirrorOrder>, ContentStoreError> {
        // Query parameters are JSON-encoded values.
        let event_param = Value::String(event_id.to_string()).to_string();
        let reference_param = Value::String(payment_reference.to_string()).to_string();

        let response = self
            .inner
            .client
            .get(format!(
                "{}/query/{}",
                self.inner.data_base, self.inner.dataset
            ))
            .query(&[
                ("query", FIND_MIRROR_QUERY),
                ("$eventId", event_param.as_str()),
                ("$reference", reference_param.as_str()),
            ])
            .bearer_auth(self.inner.token.expose_secret())
            .send()
            .await?;

        let found: QueryResponse<MirrorOrder> = Self::read(response).await?;
        debug!(found = found.result.is_some(), "Mirror lookup");
        Ok(found.result)
    }

    #[instrument(skip(self, mirror), fields(order_id = %mirror.order_id, payment_reference = %mirror.payment_reference))]
    async fn create_mirror(&self, mirror: &MirrorOrder) -> Result<MirrorWrite, ContentStoreError> {
        let document = mirror_document(mirror)?;
        let response = self
            .mutate(json!({ "createIfNotExists": document }))
            .await?;

        let operation = response
            .results
            .first()
            .and_then(|r| r.operation.as_deref())
            .unwrap_or("none");

        if operation == "none" {
            debug!("Mirror already existed");
            Ok(MirrorWrite::AlreadyExists)
        } else {
            debug!(operation, "Mirror created");
            Ok(MirrorWrite::Created)
        }
    }

    #[instrument(skip(self, request), fields(quote_id = %request.id, kind = %request.kind))]
    async fn create_quote_request(&self, request: &QuoteRequest) -> Result<(), ContentStoreError> {
        self.mutate(json!({ "createIfNotExists": quote_document(request) }))
            .await?;
        debug!("Quote request stored");
        Ok(())
    }
}
