//! Webhook signature verification.
//!
//! The processor signs `"{timestamp}." + raw body` with HMAC-SHA256 and sends
//! `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]`. Several `v1` values
//! appear while a signing secret is being rolled; any one matching is enough.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Why a webhook was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// No signature header on the request.
    #[error("missing signature header")]
    MissingHeader,
    /// The header does not have the `t=...,v1=...` shape.
    #[error("malformed signature header: {0}")]
    Malformed(&'static str),
    /// The signed timestamp is too far from the current time.
    #[error("signature timestamp outside tolerance")]
    OutsideTolerance,
    /// No `v1` value matches the body.
    #[error("signature mismatch")]
    Mismatch,
    /// The signing secret cannot key an HMAC.
    #[error("invalid signing key")]
    InvalidKey,
}

/// Verifies webhook bodies against the shared signing secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed("timestamp is not a number"))?,
                );
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed("no timestamp"))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("no v1 signature"));
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

impl WebhookVerifier {
    /// Create a verifier.
    #[must_use]
    pub const fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::InvalidKey)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Verify `payload` against the signature header at time `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed, the timestamp is outside
    /// the tolerance window, or no signature matches.
    #[instrument(skip_all)]
    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let parsed = parse_header(header)?;

        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if (now.timestamp() - parsed.timestamp).abs() > tolerance {
            return Err(SignatureError::OutsideTolerance);
        }

        let mac = self.mac_for(parsed.timestamp, payload)?;
        let matched = parsed
            .signatures
            .iter()
            .filter_map(|candidate| hex::decode(candidate).ok())
            .any(|bytes| mac.clone().verify_slice(&bytes).is_ok());

        if !matched {
            return Err(SignatureError::Mismatch);
        }

        debug!("Webhook signature verified");
        Ok(())
    }

    /// Produce a signature header for `payload` as the processor would.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the secret cannot key an HMAC.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let mac = self.mac_for(timestamp, payload)?;
        Ok(format!(
            "t={timestamp},v1={}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}
