//! Pricing authority: the only source of transaction amounts.
//!
//! Every call re-fetches from the commerce backend. There is no fallback:
//! if the backend cannot be reached the caller gets an error, never a cached
//! or client-supplied number.

use std::sync::Arc;

use redline_core::{CartId, PricedCart};
use thiserror::Error;
use tracing::{instrument, warn};

use super::retry::{RetryPolicy, Transient};
use crate::commerce::{CommerceBackend, CommerceError};

/// Errors from the pricing authority.
#[derive(Debug, Error)]
pub enum PricingError {
    /// The backend does not know this cart.
    #[error("cart {0} not found")]
    CartNotFound(CartId),

    /// The backend could not produce a price.
    #[error("pricing authority unavailable: {0}")]
    Backend(#[source] CommerceError),
}

impl Transient for PricingError {
    fn is_transient(&self) -> bool {
        match self {
            Self::CartNotFound(_) => false,
            Self::Backend(e) => e.is_transient(),
        }
    }
}

/// Reads live cart prices and totals.
#[derive(Clone)]
pub struct PricingAuthority {
    backend: Arc<dyn CommerceBackend>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PricingAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingAuthority")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PricingAuthority {
    /// Create a pricing authority over a commerce backend.
    #[must_use]
    pub fn new(backend: Arc<dyn CommerceBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// The commerce backend this authority reads from.
    #[must_use]
    pub fn backend(&self) -> &dyn CommerceBackend {
        self.backend.as_ref()
    }

    /// Fetch the cart's current items, unit prices and total.
    ///
    /// # Errors
    ///
    /// Returns `CartNotFound` for an unknown cart and `Backend` for any other
    /// failure, after retrying transient ones.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn get_cart_total(&self, cart_id: &CartId) -> Result<PricedCart, PricingError> {
        let backend = self.backend.as_ref();
        self.retry
            .run("get_cart", move || backend.get_cart(cart_id))
            .await
            .map_err(|e| match e {
                CommerceError::NotFound(_) => PricingError::CartNotFound(cart_id.clone()),
                other => {
                    warn!(error = %other, "Pricing authority unavailable, failing closed");
                    PricingError::Backend(other)
                }
            })
    }
}
