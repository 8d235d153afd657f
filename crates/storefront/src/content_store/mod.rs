//! Content store integration: order mirrors and quote requests.
//!
//! The content store is a secondary read store for internal dashboards. It
//! is never consulted for prices or fulfillment.

mod sanity;

use async_trait::async_trait;
use redline_core::{MirrorOrder, PaymentEventId, PaymentReference, QuoteRequest};
use thiserror::Error;

use crate::services::retry::Transient;

pub use sanity::{SanityClient, mirror_document_id};

/// Errors that can occur when talking to the content store.
#[derive(Debug, Error)]
pub enum ContentStoreError {
    /// HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited by the store.
    #[error("Rate limited")]
    RateLimited,

    /// The store rejected the request.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },

    /// The store returned data we cannot interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Transient for ContentStoreError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Outcome of a create-if-absent mirror write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorWrite {
    /// This call created the document.
    Created,
    /// A document with the same id was already there.
    AlreadyExists,
}

/// Operations the pipeline needs from the content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Find the mirror created for a payment event, or for the same payment
    /// under a different event id.
    async fn find_mirror(
        &self,
        event_id: &PaymentEventId,
        payment_reference: &PaymentReference,
    ) -> Result<Option<MirrorOrder>, ContentStoreError>;

    /// Create the mirror unless one with the same payment reference exists.
    async fn create_mirror(&self, mirror: &MirrorOrder) -> Result<MirrorWrite, ContentStoreError>;

    /// Persist a new quote request.
    async fn create_quote_request(&self, request: &QuoteRequest) -> Result<(), ContentStoreError>;
}
