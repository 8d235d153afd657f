//! Payment webhook intake.
//!
//! ```text
//! raw body + signature header
//!   -> verify         (invalid: 400, nothing else runs)
//!   -> parse          (unreadable after verifying: alert, acknowledge)
//!   -> dispatch on type
//!        success  -> recover session metadata -> OrderReconciler
//!        other    -> acknowledge, no-op
//! ```

use chrono::{DateTime, Utc};
use redline_core::{MetadataError, PaymentEventId, PaymentEventKind};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::{OrderReconciler, ReconcileError, Reconciliation, SucceededPayment};
use crate::payments::{PaymentError, SignatureError, WebhookVerifier, parse_event};

/// Errors from webhook intake.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The signature did not verify.
    #[error("webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    /// The verified body is not a readable event.
    #[error(transparent)]
    Malformed(PaymentError),

    /// A success event without the metadata the session builder records.
    #[error("payment event {event_id} has no usable session metadata: {source}")]
    Metadata {
        /// Event that carried it.
        event_id: PaymentEventId,
        /// What was missing.
        #[source]
        source: MetadataError,
    },

    /// Reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl ReceiverError {
    /// Failures after verification that no redelivery can fix. The payment
    /// is parked (or was never ours) and the processor should stop retrying.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Signature(_) => false,
            Self::Malformed(_) | Self::Metadata { .. } => true,
            Self::Reconcile(e) => e.is_consistency(),
        }
    }

    /// Whether this failure still needs an alert. Consistency failures alert
    /// when first detected, so a redelivered rejection stays quiet.
    #[must_use]
    pub const fn needs_alert(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Metadata { .. })
    }
}

/// What the receiver did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverOutcome {
    /// Not a success event; acknowledged.
    Ignored {
        /// Event id.
        event_id: PaymentEventId,
        /// Event type.
        event_type: String,
    },
    /// Handed to the reconciler.
    Reconciled(Reconciliation),
}

/// Verifies and dispatches payment webhooks.
#[derive(Debug, Clone)]
pub struct PaymentEventReceiver {
    verifier: WebhookVerifier,
    reconciler: OrderReconciler,
}

impl PaymentEventReceiver {
    /// Create a receiver.
    #[must_use]
    pub const fn new(verifier: WebhookVerifier, reconciler: OrderReconciler) -> Self {
        Self {
            verifier,
            reconciler,
        }
    }

    /// Handle one webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns `Signature` when the body cannot be trusted, in which case no
    /// further work is done, and the other variants for failures after
    /// verification.
    #[instrument(skip_all)]
    pub async fn receive(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReceiverOutcome, ReceiverError> {
        let header = signature.ok_or(SignatureError::MissingHeader)?;
        if let Err(e) = self.verifier.verify(payload, header, now) {
            warn!(error = %e, "Rejected webhook with invalid signature");
            return Err(e.into());
        }

        let event = parse_event(payload).map_err(|e| {
            error!(error = %e, "Verified webhook body is not a readable event");
            ReceiverError::Malformed(e)
        })?;

        match event.kind {
            PaymentEventKind::Ignored => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring event");
                Ok(ReceiverOutcome::Ignored {
                    event_id: event.id,
                    event_type: event.event_type,
                })
            }
            PaymentEventKind::Succeeded(succeeded) => {
                let payment =
                    SucceededPayment::from_event(event.id.clone(), event.event_type, &succeeded)
                        .map_err(|source| {
                            error!(
                                event_id = %event.id,
                                payment_reference = %succeeded.payment_reference,
                                error = %source,
                                "Payment has no session metadata, was the session built outside checkout?"
                            );
                            ReceiverError::Metadata {
                                event_id: event.id.clone(),
                                source,
                            }
                        })?;

                info!(
                    event_id = %payment.event_id,
                    cart_id = %payment.cart_id(),
                    "Payment succeeded, reconciling"
                );
                let reconciliation = self.reconciler.reconcile(&payment).await?;
                Ok(ReceiverOutcome::Reconciled(reconciliation))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use redline_core::{CartId, CurrencyCode, Money};

    use super::*;
    use crate::commerce::CommerceError;

    #[test]
    fn test_permanent_failures_are_acknowledged() {
        let malformed = ReceiverError::Malformed(PaymentError::MalformedEvent("no id".into()));
        assert!(malformed.is_permanent());
        assert!(malformed.needs_alert());

        let metadata = ReceiverError::Metadata {
            event_id: PaymentEventId::parse("evt_1").unwrap(),
            source: MetadataError::Missing("source_cart_id"),
        };
        assert!(metadata.is_permanent());
        assert!(metadata.needs_alert());

        let mismatch = ReceiverError::Reconcile(ReconcileError::AmountMismatch {
            cart_id: CartId::parse("cart_01").unwrap(),
            captured: Money::from_minor(10500, CurrencyCode::USD),
            live: Money::from_minor(9000, CurrencyCode::USD),
        });
        assert!(mismatch.is_permanent());
        assert!(!mismatch.needs_alert());
    }

    #[test]
    fn test_retryable_failures_are_refused() {
        let signature = ReceiverError::Signature(SignatureError::Mismatch);
        assert!(!signature.is_permanent());

        let in_flight = ReceiverError::Reconcile(ReconcileError::InFlight(
            PaymentEventId::parse("evt_1").unwrap(),
        ));
        assert!(!in_flight.is_permanent());

        let outage = ReceiverError::Reconcile(ReconcileError::Commerce(CommerceError::RateLimited));
        assert!(!outage.is_permanent());
    }
}
