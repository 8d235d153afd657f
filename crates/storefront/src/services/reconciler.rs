//! Order reconciliation: turns a captured payment into exactly one order.
//!
//! Guards run in a fixed order and each one is allowed to end the
//! invocation:
//!
//! 1. Content-store mirror lookup by event id or payment reference.
//! 2. Ledger claim. The ledger's primary key and unique payment reference
//!    make concurrent duplicate deliveries lose here even when both passed
//!    step 1.
//! 3. Amount verification against the live cart total, exact to the minor
//!    unit.
//! 4. Completion in the commerce backend, keyed by cart id. A cart that was
//!    already completed by a different payment is refused.
//! 5. Ledger completion, then the mirror write. Failures from here on are
//!    logged for the operator and never undo the order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redline_core::{
    AuthoritativeOrder, CartId, EventStatus, MetadataError, MirrorOrder, Money, OrderId,
    PaymentEventId, PaymentReference, PaymentSucceeded, SessionMetadata,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::notify::{Notification, Notifier};
use super::pricing::{PricingAuthority, PricingError};
use super::retry::{RetryPolicy, Transient};
use crate::commerce::CommerceError;
use crate::content_store::{ContentStore, ContentStoreError, MirrorWrite};
use crate::db::{Claim, ClaimToken, EventLedger, NewClaim, RepositoryError};

/// A successful payment with its checkout context recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SucceededPayment {
    /// Processor event id; the idempotency key.
    pub event_id: PaymentEventId,
    /// Raw event type.
    pub event_type: String,
    /// Processor payment reference.
    pub payment_reference: PaymentReference,
    /// Amount the processor captured.
    pub amount_captured: Money,
    /// Context recorded when the session was built.
    pub metadata: SessionMetadata,
}

impl SucceededPayment {
    /// Attach the session metadata carried by a success event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payment did not come from a session this
    /// storefront built.
    pub fn from_event(
        event_id: PaymentEventId,
        event_type: String,
        payment: &PaymentSucceeded,
    ) -> Result<Self, MetadataError> {
        Ok(Self {
            metadata: payment.session_metadata()?,
            event_id,
            event_type,
            payment_reference: payment.payment_reference.clone(),
            amount_captured: payment.amount_captured,
        })
    }

    /// Cart the payment is for.
    #[must_use]
    pub const fn cart_id(&self) -> &CartId {
        &self.metadata.source_cart_id
    }
}

/// State of the content-store mirror after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    /// Created by this call.
    Written,
    /// A mirror with the same id was already present.
    AlreadyExisted,
    /// The write failed; the ledger keeps it pending for `events remirror`.
    Pending,
}

/// How a payment event was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// A mirror already exists; nothing was done.
    AlreadyMirrored {
        /// Order the mirror points to.
        order_id: OrderId,
    },
    /// The ledger already holds a completed entry for this payment.
    Duplicate {
        /// Order recorded for it, if known.
        order_id: Option<OrderId>,
    },
    /// This call created (or recovered) the order.
    Completed {
        /// Authoritative order id.
        order_id: OrderId,
        /// The commerce backend reported the cart as already completed.
        already_completed: bool,
        /// Mirror write outcome.
        mirror: MirrorStatus,
    },
}

impl Reconciliation {
    /// Order id, when one is known.
    #[must_use]
    pub const fn order_id(&self) -> Option<&OrderId> {
        match self {
            Self::AlreadyMirrored { order_id } | Self::Completed { order_id, .. } => Some(order_id),
            Self::Duplicate { order_id } => order_id.as_ref(),
        }
    }
}

/// Errors from the reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another delivery of this payment holds a fresh claim.
    #[error("payment event {0} is already being processed")]
    InFlight(PaymentEventId),

    /// An earlier attempt was rejected and is waiting for an operator.
    #[error("payment event {0} was rejected earlier and needs manual review")]
    PreviouslyRejected(PaymentEventId),

    /// The captured amount differs from the live cart total.
    #[error("captured {captured} does not match live cart total {live} for cart {cart_id}")]
    AmountMismatch {
        /// Cart that was paid for.
        cart_id: CartId,
        /// Amount the processor captured.
        captured: Money,
        /// Total the commerce backend reports now.
        live: Money,
    },

    /// The cart already became an order paid for by another payment.
    #[error(
        "cart {cart_id} was already paid by {paid_by}, payment {payment_reference} was not applied"
    )]
    CartAlreadyPaid {
        /// Cart that was paid for twice.
        cart_id: CartId,
        /// Payment this delivery carried.
        payment_reference: PaymentReference,
        /// Payment that owns the cart's order.
        paid_by: PaymentReference,
        /// The existing order, when known.
        order_id: Option<OrderId>,
    },

    /// Live prices could not be read.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// The commerce backend refused to complete the cart.
    #[error(transparent)]
    Commerce(#[from] CommerceError),

    /// The content store failed.
    #[error(transparent)]
    ContentStore(#[from] ContentStoreError),

    /// The event ledger failed.
    #[error(transparent)]
    Ledger(#[from] RepositoryError),
}

impl ReconcileError {
    /// Errors that must park the payment for an operator instead of being
    /// retried.
    #[must_use]
    pub const fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::AmountMismatch { .. }
                | Self::CartAlreadyPaid { .. }
                | Self::PreviouslyRejected(_)
        )
    }
}

impl Transient for ReconcileError {
    fn is_transient(&self) -> bool {
        match self {
            Self::InFlight(_)
            | Self::PreviouslyRejected(_)
            | Self::AmountMismatch { .. }
            | Self::CartAlreadyPaid { .. } => false,
            Self::Pricing(e) => e.is_transient(),
            Self::Commerce(e) => e.is_transient(),
            Self::ContentStore(e) => e.is_transient(),
            Self::Ledger(e) => e.is_transient(),
        }
    }
}

/// Counts from a remirror run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemirrorReport {
    /// Mirrors created or found already present.
    pub mirrored: usize,
    /// Entries still pending after this run.
    pub pending: usize,
}

/// Settles payment events into orders.
#[derive(Clone)]
pub struct OrderReconciler {
    pricing: PricingAuthority,
    content_store: Arc<dyn ContentStore>,
    ledger: Arc<dyn EventLedger>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    claim_lease: Duration,
}

impl std::fmt::Debug for OrderReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderReconciler")
            .field("pricing", &self.pricing)
            .field("retry", &self.retry)
            .field("claim_lease", &self.claim_lease)
            .finish_non_exhaustive()
    }
}

impl OrderReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        pricing: PricingAuthority,
        content_store: Arc<dyn ContentStore>,
        ledger: Arc<dyn EventLedger>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        claim_lease: Duration,
    ) -> Self {
        Self {
            pricing,
            content_store,
            ledger,
            notifier,
            retry,
            claim_lease,
        }
    }

    /// Settle one successful payment.
    ///
    /// Safe to call any number of times, concurrently, for the same payment:
    /// at most one call reaches the commerce backend's completion step.
    ///
    /// # Errors
    ///
    /// Returns `AmountMismatch` when the cart changed after checkout,
    /// `CartAlreadyPaid` when another payment already completed the cart,
    /// `InFlight` or `PreviouslyRejected` for a payment this call must not
    /// touch, and downstream errors otherwise. A returned error never means
    /// an order was created.
    #[instrument(
        skip(self, payment),
        fields(
            event_id = %payment.event_id,
            payment_reference = %payment.payment_reference,
            cart_id = %payment.cart_id(),
        )
    )]
    pub async fn reconcile(
        &self,
        payment: &SucceededPayment,
    ) -> Result<Reconciliation, ReconcileError> {
        if let Some(mirror) = self.lookup_mirror(payment).await {
            info!(order_id = %mirror.order_id, "Mirror exists, payment already reconciled");
            self.complete_from_mirror(&mirror).await;
            return Ok(Reconciliation::AlreadyMirrored {
                order_id: mirror.order_id,
            });
        }

        let claim = NewClaim {
            event_id: payment.event_id.clone(),
            payment_reference: payment.payment_reference.clone(),
            event_type: payment.event_type.clone(),
            cart_id: payment.cart_id().clone(),
            captured: payment.amount_captured,
            carrier: Some(payment.metadata.carrier.clone()),
        };
        let ledger = self.ledger.as_ref();
        let lease = self.claim_lease;
        let claim_ref = &claim;
        let outcome = self
            .retry
            .run("ledger_claim", move || ledger.claim(claim_ref, lease))
            .await?;

        match outcome {
            Claim::Completed(entry) => {
                info!(order_id = ?entry.order_id, "Payment already completed, skipping");
                if let Some(mirror) = entry.to_mirror().filter(|_| entry.mirror_pending) {
                    self.write_mirror(&mirror).await;
                }
                Ok(Reconciliation::Duplicate {
                    order_id: entry.order_id,
                })
            }
            Claim::InFlight => {
                warn!("Concurrent delivery holds the claim");
                Err(ReconcileError::InFlight(payment.event_id.clone()))
            }
            Claim::Rejected(entry) => {
                warn!(
                    last_error = ?entry.last_error,
                    "Payment was rejected earlier, refusing to retry automatically"
                );
                Err(ReconcileError::PreviouslyRejected(entry.event_id))
            }
            Claim::Acquired(token) => match self.settle(&token, payment).await {
                Ok(reconciliation) => Ok(reconciliation),
                Err(err) => {
                    self.release_claim(&token, &err).await;
                    Err(err)
                }
            },
        }
    }

    /// Re-create mirrors for completed payments whose mirror write failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    #[instrument(skip(self))]
    pub async fn remirror_pending(&self, limit: i64) -> Result<RemirrorReport, ReconcileError> {
        let entries = self.ledger.list_mirror_pending(limit).await?;
        let mut report = RemirrorReport::default();

        for entry in entries {
            let Some(mirror) = entry.to_mirror() else {
                warn!(event_id = %entry.event_id, "Pending mirror has no order id, skipping");
                report.pending += 1;
                continue;
            };
            match self.write_mirror(&mirror).await {
                MirrorStatus::Written | MirrorStatus::AlreadyExisted => report.mirrored += 1,
                MirrorStatus::Pending => report.pending += 1,
            }
        }

        info!(
            mirrored = report.mirrored,
            pending = report.pending,
            "Remirror run finished"
        );
        Ok(report)
    }

    async fn lookup_mirror(&self, payment: &SucceededPayment) -> Option<MirrorOrder> {
        let store = self.content_store.as_ref();
        let event_id = &payment.event_id;
        let reference = &payment.payment_reference;
        match self
            .retry
            .run("find_mirror", move || store.find_mirror(event_id, reference))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                // The ledger claim below still enforces uniqueness.
                warn!(error = %e, "Mirror lookup failed, relying on ledger claim");
                None
            }
        }
    }

    async fn settle(
        &self,
        token: &ClaimToken,
        payment: &SucceededPayment,
    ) -> Result<Reconciliation, ReconcileError> {
        let cart_id = payment.cart_id();
        let cart = self.pricing.get_cart_total(cart_id).await?;

        if cart.total != payment.amount_captured {
            alert_amount_mismatch(payment, cart.total);
            return Err(ReconcileError::AmountMismatch {
                cart_id: cart_id.clone(),
                captured: payment.amount_captured,
                live: cart.total,
            });
        }

        if cart.completed {
            self.ensure_cart_unpaid(payment, None).await?;
        }

        let backend = self.pricing.backend();
        let reference = &payment.payment_reference;
        let completed = self
            .retry
            .run("complete_cart", move || {
                backend.complete_cart(cart_id, reference)
            })
            .await?;

        if completed.already_completed && !cart.completed {
            self.ensure_cart_unpaid(payment, Some(&completed.order_id))
                .await?;
        }

        if let Some(total) = completed
            .total
            .filter(|total| *total != payment.amount_captured)
        {
            warn!(
                order_id = %completed.order_id,
                order_total = %total,
                captured = %payment.amount_captured,
                "Order total differs from captured amount"
            );
        }
        info!(
            order_id = %completed.order_id,
            already_completed = completed.already_completed,
            "Cart completed"
        );

        if let Err(e) = self.ledger.mark_completed(token, &completed.order_id).await {
            error!(
                error = %e,
                order_id = %completed.order_id,
                "Order exists but ledger completion failed, needs manual reconciliation"
            );
        }

        if let Some(email) = cart.email.filter(|_| !completed.already_completed) {
            let notification = Notification::OrderPlaced {
                order_id: completed.order_id.clone(),
                cart_id: cart_id.clone(),
                email,
                total: payment.amount_captured,
            };
            if let Err(e) = self.notifier.notify(&notification).await {
                warn!(error = %e, "Order notification failed");
            }
        }

        let order = AuthoritativeOrder {
            id: completed.order_id.clone(),
            source_cart_id: cart_id.clone(),
            total: payment.amount_captured,
            payment_reference: payment.payment_reference.clone(),
        };
        let mirror = MirrorOrder::of(
            &order,
            token.event_id().clone(),
            Some(payment.metadata.carrier.clone()),
            Utc::now(),
        );
        let mirror_status = self.write_mirror(&mirror).await;

        Ok(Reconciliation::Completed {
            order_id: completed.order_id,
            already_completed: completed.already_completed,
            mirror: mirror_status,
        })
    }

    /// Refuse a payment for a cart that another payment already owns.
    ///
    /// Any ledger row for the cart under a different payment reference counts,
    /// except rejected ones, which never reached completion. A completed cart
    /// with no such row is this payment's own earlier completion.
    async fn ensure_cart_unpaid(
        &self,
        payment: &SucceededPayment,
        known_order: Option<&OrderId>,
    ) -> Result<(), ReconcileError> {
        let cart_id = payment.cart_id();
        let ledger = self.ledger.as_ref();
        let entries = self
            .retry
            .run("list_by_cart", move || ledger.list_by_cart(cart_id))
            .await?;

        let Some(owner) = entries.into_iter().find(|entry| {
            entry.payment_reference != payment.payment_reference
                && entry.status != EventStatus::Rejected
        }) else {
            return Ok(());
        };

        let order_id = owner.order_id.or_else(|| known_order.cloned());
        alert_cart_already_paid(payment, &owner.payment_reference, order_id.as_ref());
        Err(ReconcileError::CartAlreadyPaid {
            cart_id: cart_id.clone(),
            payment_reference: payment.payment_reference.clone(),
            paid_by: owner.payment_reference,
            order_id,
        })
    }

    /// Finish a ledger row whose completion was lost after the mirror was
    /// written.
    async fn complete_from_mirror(&self, mirror: &MirrorOrder) {
        match self
            .ledger
            .complete_from_mirror(&mirror.payment_event_id, &mirror.order_id)
            .await
        {
            Ok(true) => warn!(
                row = %mirror.payment_event_id,
                order_id = %mirror.order_id,
                "Ledger row was still processing, completed it from the mirror"
            ),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not complete ledger row from mirror"),
        }
    }

    async fn write_mirror(&self, mirror: &MirrorOrder) -> MirrorStatus {
        let store = self.content_store.as_ref();
        let written = self
            .retry
            .run("create_mirror", move || store.create_mirror(mirror))
            .await;

        let status = match written {
            Ok(MirrorWrite::Created) => MirrorStatus::Written,
            Ok(MirrorWrite::AlreadyExists) => MirrorStatus::AlreadyExisted,
            Err(e) => {
                error!(
                    error = %e,
                    event_id = %mirror.payment_event_id,
                    order_id = %mirror.order_id,
                    "Mirror write failed, left pending"
                );
                if let Err(e) = self
                    .ledger
                    .note_mirror_failure(&mirror.payment_event_id, &e.to_string())
                    .await
                {
                    error!(error = %e, "Could not record pending mirror");
                }
                return MirrorStatus::Pending;
            }
        };

        if let Err(e) = self.ledger.mark_mirrored(&mirror.payment_event_id).await {
            warn!(error = %e, "Mirror written but ledger flag not cleared");
        }
        status
    }

    async fn release_claim(&self, token: &ClaimToken, err: &ReconcileError) {
        let reason = err.to_string();
        let released = if err.is_consistency() {
            self.ledger.mark_rejected(token, &reason).await
        } else {
            self.ledger.mark_failed(token, &reason).await
        };
        if let Err(e) = released {
            error!(error = %e, event_id = %token.event_id(), "Could not release ledger claim");
        }
    }
}

fn alert_amount_mismatch(payment: &SucceededPayment, live: Money) {
    error!(
        captured_minor_units = payment.amount_captured.minor_units,
        live_minor_units = live.minor_units,
        currency = %payment.amount_captured.currency,
        "Captured amount does not match live cart total, order not completed"
    );
    sentry::with_scope(
        |scope| {
            scope.set_tag("cart_id", payment.cart_id());
            scope.set_tag("event_id", &payment.event_id);
            scope.set_tag("captured_minor_units", payment.amount_captured.minor_units);
            scope.set_tag("live_minor_units", live.minor_units);
        },
        || {
            sentry::capture_message(
                "Payment amount mismatch: order finalization aborted",
                sentry::Level::Error,
            )
        },
    );
}

fn alert_cart_already_paid(
    payment: &SucceededPayment,
    paid_by: &PaymentReference,
    order_id: Option<&OrderId>,
) {
    error!(
        paid_by = %paid_by,
        order_id = ?order_id,
        captured_minor_units = payment.amount_captured.minor_units,
        "Second payment for an already completed cart, refund required"
    );
    sentry::with_scope(
        |scope| {
            scope.set_tag("cart_id", payment.cart_id());
            scope.set_tag("event_id", &payment.event_id);
            scope.set_tag("payment_reference", &payment.payment_reference);
            scope.set_tag("paid_by", paid_by);
        },
        || {
            sentry::capture_message(
                "Duplicate payment: cart already completed by another payment",
                sentry::Level::Error,
            )
        },
    );
}
