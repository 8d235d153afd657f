//! Quote and lead intake.
//!
//! Validate, persist, then notify. Persistence is the durability boundary:
//! once the request is stored the submission succeeds whatever happens to
//! the notification.

use std::sync::Arc;

use chrono::Utc;
use redline_core::{NewQuoteRequest, QuoteRequestId, QuoteValidationError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::notify::{Notification, Notifier};
use super::retry::{RetryPolicy, Transient};
use crate::content_store::{ContentStore, ContentStoreError};

/// Errors from quote intake.
#[derive(Debug, Error)]
pub enum QuoteError {
    /// The submission broke a schema rule.
    #[error(transparent)]
    Validation(#[from] QuoteValidationError),

    /// The request could not be stored.
    #[error(transparent)]
    Store(#[from] ContentStoreError),
}

impl Transient for QuoteError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Store(e) => e.is_transient(),
        }
    }
}

/// Accepts quote, wheel-spec and wholesale requests.
#[derive(Clone)]
pub struct QuoteIntake {
    store: Arc<dyn ContentStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for QuoteIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteIntake")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl QuoteIntake {
    /// Create a quote intake.
    #[must_use]
    pub fn new(
        store: Arc<dyn ContentStore>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            retry,
        }
    }

    /// Validate and store a submission.
    ///
    /// # Errors
    ///
    /// Returns `Validation` before anything is stored, or `Store` if the
    /// content store rejects the write. Notification failures are logged
    /// only.
    #[instrument(skip(self, submission), fields(kind = %submission.kind))]
    pub async fn submit(&self, submission: NewQuoteRequest) -> Result<QuoteRequestId, QuoteError> {
        let request = submission.validate(QuoteRequestId::new_random(), Utc::now())?;

        let store = self.store.as_ref();
        let stored = &request;
        self.retry
            .run("create_quote_request", move || {
                store.create_quote_request(stored)
            })
            .await?;
        info!(request_id = %request.id, "Quote request stored");

        let notification = Notification::QuoteSubmitted {
            id: request.id,
            kind: request.kind,
            name: request.contact.name.clone(),
            email: request.contact.email.clone(),
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(error = %e, request_id = %request.id, "Quote notification failed");
        }

        Ok(request.id)
    }
}
