//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::commerce::{CommerceBackend, CommerceClient, CommerceError};
use crate::config::StorefrontConfig;
use crate::content_store::{ContentStore, ContentStoreError, SanityClient};
use crate::db::{EventLedger, PgEventLedger};
use crate::payments::{PaymentError, PaymentProcessor, StripeClient, WebhookVerifier};
use crate::services::{
    CheckoutSessionBuilder, KlaviyoClient, NoopNotifier, Notifier, NotifyError, OrderReconciler,
    PaymentEventReceiver, PricingAuthority, QuoteIntake, RetryPolicy,
};

/// Error wiring the outbound clients.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("commerce client: {0}")]
    Commerce(#[from] CommerceError),
    #[error("payment client: {0}")]
    Payments(#[from] PaymentError),
    #[error("content store client: {0}")]
    ContentStore(#[from] ContentStoreError),
    #[error("notification client: {0}")]
    Notify(#[from] NotifyError),
}

/// External systems the pipeline talks to.
///
/// Production wires the HTTP clients and the Postgres ledger; tests swap in
/// in-memory fakes.
#[derive(Clone)]
pub struct Backends {
    /// Commerce backend (pricing authority and order store).
    pub commerce: Arc<dyn CommerceBackend>,
    /// Payment processor.
    pub payments: Arc<dyn PaymentProcessor>,
    /// Content store for mirrors and quote requests.
    pub content_store: Arc<dyn ContentStore>,
    /// Durable payment event ledger.
    pub ledger: Arc<dyn EventLedger>,
    /// Customer notifications.
    pub notifier: Arc<dyn Notifier>,
}

impl Backends {
    /// Build the production clients from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any HTTP client cannot be constructed.
    pub fn from_config(config: &StorefrontConfig, pool: PgPool) -> Result<Self, StateError> {
        let timeout = config.outbound_timeout;

        let notifier: Arc<dyn Notifier> = match &config.klaviyo {
            Some(klaviyo) => Arc::new(KlaviyoClient::new(klaviyo, timeout)?),
            None => {
                warn!("KLAVIYO_API_KEY not set, notifications disabled");
                Arc::new(NoopNotifier)
            }
        };

        Ok(Self {
            commerce: Arc::new(CommerceClient::new(&config.commerce, timeout)?),
            payments: Arc::new(StripeClient::new(&config.stripe, timeout)?),
            content_store: Arc::new(SanityClient::new(&config.sanity, timeout)?),
            ledger: Arc::new(PgEventLedger::new(pool)),
            notifier,
        })
    }
}

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    checkout: CheckoutSessionBuilder,
    receiver: PaymentEventReceiver,
    reconciler: OrderReconciler,
    quotes: QuoteIntake,
    ledger: Arc<dyn EventLedger>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("checkout", &self.inner.checkout)
            .field("reconciler", &self.inner.reconciler)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble the pipeline services over a set of backends.
    #[must_use]
    pub fn new(config: &StorefrontConfig, backends: Backends) -> Self {
        let retry = RetryPolicy::from(&config.reconcile);
        let verifier = WebhookVerifier::new(
            config.stripe.webhook_secret.clone(),
            config.stripe.webhook_tolerance,
        );
        Self::assemble(
            backends,
            verifier,
            config.checkout.allowed_carriers.clone(),
            retry,
            config.reconcile.claim_lease,
        )
    }

    /// Assemble the services with explicit settings instead of a full
    /// configuration.
    #[must_use]
    pub fn assemble(
        backends: Backends,
        verifier: WebhookVerifier,
        allowed_carriers: Vec<redline_core::Carrier>,
        retry: RetryPolicy,
        claim_lease: std::time::Duration,
    ) -> Self {
        let pricing = PricingAuthority::new(Arc::clone(&backends.commerce), retry);
        let checkout = CheckoutSessionBuilder::new(
            pricing.clone(),
            Arc::clone(&backends.payments),
            allowed_carriers,
        );
        let reconciler = OrderReconciler::new(
            pricing,
            Arc::clone(&backends.content_store),
            Arc::clone(&backends.ledger),
            Arc::clone(&backends.notifier),
            retry,
            claim_lease,
        );
        let receiver = PaymentEventReceiver::new(verifier, reconciler.clone());
        let quotes = QuoteIntake::new(
            Arc::clone(&backends.content_store),
            Arc::clone(&backends.notifier),
            retry,
        );

        info!(
            allowed_carriers = ?checkout.allowed_carriers(),
            max_attempts = retry.max_attempts(),
            "Checkout pipeline assembled"
        );

        Self {
            inner: Arc::new(AppStateInner {
                checkout,
                receiver,
                reconciler,
                quotes,
                ledger: backends.ledger,
            }),
        }
    }

    /// Checkout session builder.
    #[must_use]
    pub fn checkout(&self) -> &CheckoutSessionBuilder {
        &self.inner.checkout
    }

    /// Payment webhook receiver.
    #[must_use]
    pub fn receiver(&self) -> &PaymentEventReceiver {
        &self.inner.receiver
    }

    /// Order reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &OrderReconciler {
        &self.inner.reconciler
    }

    /// Quote intake.
    #[must_use]
    pub fn quotes(&self) -> &QuoteIntake {
        &self.inner.quotes
    }

    /// Payment event ledger.
    #[must_use]
    pub fn ledger(&self) -> &dyn EventLedger {
        self.inner.ledger.as_ref()
    }
}
