//! In-memory stand-ins for the external systems.
//!
//! Each fake keeps its state behind a `std::sync::Mutex` that is never held
//! across an `.await`, and exposes counters so tests can assert on side
//! effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redline_core::{
    CartId, CheckoutSession, CheckoutSessionId, EventStatus, FulfillmentMethod,
    FulfillmentMethodId, MirrorOrder, OrderId, PaymentEventId, PaymentReference, PricedCart,
    QuoteRequest,
};
use redline_storefront::commerce::{
    CommerceBackend, CommerceError, CompletedOrder, FulfillmentOption,
};
use redline_storefront::content_store::{
    ContentStore, ContentStoreError, MirrorWrite, mirror_document_id,
};
use redline_storefront::db::{
    Claim, ClaimToken, EventLedger, LedgerEntry, NewClaim, RepositoryError,
};
use redline_storefront::payments::{CheckoutSessionRequest, PaymentError, PaymentProcessor};
use redline_storefront::services::{Notification, Notifier, NotifyError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(what: &str) -> (u16, String) {
    (503, format!("{what} temporarily unavailable"))
}

// =============================================================================
// Commerce backend
// =============================================================================

#[derive(Debug, Default)]
struct CommerceState {
    carts: HashMap<CartId, PricedCart>,
    options: HashMap<CartId, Vec<FulfillmentOption>>,
    orders: HashMap<CartId, OrderId>,
    completion_calls: usize,
    failing_completions: u32,
}

/// Commerce backend holding carts in memory.
///
/// Completion is idempotent per cart, like the real backend: the second call
/// returns the first order with `already_completed`.
#[derive(Debug, Default)]
pub struct FakeCommerce {
    state: Mutex<CommerceState>,
}

impl FakeCommerce {
    /// Store or replace a cart.
    pub fn insert_cart(&self, cart: PricedCart) {
        lock(&self.state).carts.insert(cart.id.clone(), cart);
    }

    /// Set the shipping options offered for a cart.
    pub fn set_options(&self, cart_id: &CartId, options: Vec<FulfillmentOption>) {
        lock(&self.state).options.insert(cart_id.clone(), options);
    }

    /// Edit a stored cart in place, as a customer tab or an admin would.
    pub fn update_cart(&self, cart_id: &CartId, edit: impl FnOnce(&mut PricedCart)) {
        if let Some(cart) = lock(&self.state).carts.get_mut(cart_id) {
            edit(cart);
        }
    }

    /// The next `count` completions fail with a transient 503.
    pub fn fail_next_completions(&self, count: u32) {
        lock(&self.state).failing_completions = count;
    }

    /// Number of distinct orders created.
    #[must_use]
    pub fn orders_created(&self) -> usize {
        lock(&self.state).orders.len()
    }

    /// Order created for a cart, if any.
    #[must_use]
    pub fn order_for(&self, cart_id: &CartId) -> Option<OrderId> {
        lock(&self.state).orders.get(cart_id).cloned()
    }

    /// Number of `complete_cart` calls, failed ones included.
    #[must_use]
    pub fn completion_calls(&self) -> usize {
        lock(&self.state).completion_calls
    }
}

#[async_trait]
impl CommerceBackend for FakeCommerce {
    async fn get_cart(&self, cart_id: &CartId) -> Result<PricedCart, CommerceError> {
        // A network hop: a reconciler holding a fresh claim is parked here.
        tokio::task::yield_now().await;

        lock(&self.state)
            .carts
            .get(cart_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(format!("cart {cart_id}")))
    }

    async fn list_fulfillment_options(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<FulfillmentOption>, CommerceError> {
        let state = lock(&self.state);
        if !state.carts.contains_key(cart_id) {
            return Err(CommerceError::NotFound(format!("cart {cart_id}")));
        }
        Ok(state.options.get(cart_id).cloned().unwrap_or_default())
    }

    async fn attach_fulfillment(
        &self,
        cart_id: &CartId,
        option_id: &FulfillmentMethodId,
    ) -> Result<PricedCart, CommerceError> {
        let mut state = lock(&self.state);
        let option = state
            .options
            .get(cart_id)
            .and_then(|options| options.iter().find(|option| &option.id == option_id))
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(format!("shipping option {option_id}")))?;
        let cart = state
            .carts
            .get_mut(cart_id)
            .ok_or_else(|| CommerceError::NotFound(format!("cart {cart_id}")))?;

        cart.total = cart
            .subtotal
            .checked_add(option.amount)
            .map_err(|e| CommerceError::InvalidResponse(e.to_string()))?;
        cart.fulfillment = Some(FulfillmentMethod {
            id: option.id,
            carrier: option.carrier,
            service: option.service,
            amount: option.amount,
        });
        Ok(cart.clone())
    }

    async fn complete_cart(
        &self,
        cart_id: &CartId,
        _payment_reference: &PaymentReference,
    ) -> Result<CompletedOrder, CommerceError> {
        let mut state = lock(&self.state);
        state.completion_calls += 1;
        if state.failing_completions > 0 {
            state.failing_completions -= 1;
            let (status, message) = unavailable("cart completion");
            return Err(CommerceError::Api { status, message });
        }

        let total = state
            .carts
            .get(cart_id)
            .map(|cart| cart.total)
            .ok_or_else(|| CommerceError::NotFound(format!("cart {cart_id}")))?;

        if let Some(order_id) = state.orders.get(cart_id) {
            return Ok(CompletedOrder {
                order_id: order_id.clone(),
                total: Some(total),
                already_completed: true,
            });
        }

        let order_id = OrderId::parse(&format!("order_{:03}", state.orders.len() + 1))
            .map_err(|e| CommerceError::InvalidResponse(e.to_string()))?;
        state.orders.insert(cart_id.clone(), order_id.clone());
        if let Some(cart) = state.carts.get_mut(cart_id) {
            cart.completed = true;
        }

        Ok(CompletedOrder {
            order_id,
            total: Some(total),
            already_completed: false,
        })
    }
}

// =============================================================================
// Payment processor
// =============================================================================

#[derive(Debug, Default)]
struct PaymentsState {
    requests: Vec<CheckoutSessionRequest>,
    sessions: HashMap<String, CheckoutSession>,
}

/// Payment processor that honours idempotency keys.
#[derive(Debug, Default)]
pub struct FakePayments {
    state: Mutex<PaymentsState>,
}

impl FakePayments {
    /// Every session request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<CheckoutSessionRequest> {
        lock(&self.state).requests.clone()
    }

    /// The most recent session request.
    #[must_use]
    pub fn last_request(&self) -> Option<CheckoutSessionRequest> {
        lock(&self.state).requests.last().cloned()
    }

    /// Number of distinct sessions created.
    #[must_use]
    pub fn sessions_created(&self) -> usize {
        lock(&self.state).sessions.len()
    }
}

#[async_trait]
impl PaymentProcessor for FakePayments {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());
        if let Some(existing) = state.sessions.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let number = state.sessions.len() + 1;
        let id = CheckoutSessionId::parse(&format!("cs_test_{number}"))
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;
        let session = CheckoutSession::new(
            id,
            format!("https://pay.example.test/c/cs_test_{number}"),
            request.currency,
            request.metadata.clone(),
            request.entries.clone(),
            Some(Utc::now() + chrono::Duration::hours(24)),
        )
        .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;

        state
            .sessions
            .insert(request.idempotency_key.clone(), session.clone());
        Ok(session)
    }
}

// =============================================================================
// Content store
// =============================================================================

#[derive(Debug, Default)]
struct ContentState {
    mirrors: HashMap<String, MirrorOrder>,
    quotes: Vec<QuoteRequest>,
    failing_mirror_writes: u32,
    mirror_writes: usize,
}

/// Content store keyed by deterministic mirror document ids.
#[derive(Debug, Default)]
pub struct FakeContentStore {
    state: Mutex<ContentState>,
    reject_quotes: AtomicBool,
}

impl FakeContentStore {
    /// The next `count` mirror writes fail with a transient 503.
    pub fn fail_next_mirror_writes(&self, count: u32) {
        lock(&self.state).failing_mirror_writes = count;
    }

    /// Make quote writes fail.
    pub fn reject_quotes(&self, reject: bool) {
        self.reject_quotes.store(reject, Ordering::SeqCst);
    }

    /// Every mirror document stored.
    #[must_use]
    pub fn mirrors(&self) -> Vec<MirrorOrder> {
        lock(&self.state).mirrors.values().cloned().collect()
    }

    /// Mirror write attempts, failed ones included.
    #[must_use]
    pub fn mirror_writes(&self) -> usize {
        lock(&self.state).mirror_writes
    }

    /// Stored quote requests.
    #[must_use]
    pub fn quotes(&self) -> Vec<QuoteRequest> {
        lock(&self.state).quotes.clone()
    }
}

#[async_trait]
impl ContentStore for FakeContentStore {
    async fn find_mirror(
        &self,
        event_id: &PaymentEventId,
        payment_reference: &PaymentReference,
    ) -> Result<Option<MirrorOrder>, ContentStoreError> {
        // Lets concurrent deliveries both pass the lookup before either claims.
        tokio::task::yield_now().await;

        Ok(lock(&self.state)
            .mirrors
            .values()
            .find(|mirror| {
                &mirror.payment_event_id == event_id
                    || &mirror.payment_reference == payment_reference
            })
            .cloned())
    }

    async fn create_mirror(&self, mirror: &MirrorOrder) -> Result<MirrorWrite, ContentStoreError> {
        let mut state = lock(&self.state);
        state.mirror_writes += 1;
        if state.failing_mirror_writes > 0 {
            state.failing_mirror_writes -= 1;
            let (status, message) = unavailable("content store");
            return Err(ContentStoreError::Api { status, message });
        }

        let id = mirror_document_id(&mirror.payment_reference);
        if state.mirrors.contains_key(&id) {
            return Ok(MirrorWrite::AlreadyExists);
        }
        state.mirrors.insert(id, mirror.clone());
        Ok(MirrorWrite::Created)
    }

    async fn create_quote_request(&self, request: &QuoteRequest) -> Result<(), ContentStoreError> {
        if self.reject_quotes.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Api {
                status: 400,
                message: "document rejected".to_string(),
            });
        }
        lock(&self.state).quotes.push(request.clone());
        Ok(())
    }
}

// =============================================================================
// Event ledger
// =============================================================================

#[derive(Debug)]
struct LedgerRow {
    entry: LedgerEntry,
    token: Option<ClaimToken>,
}

/// Event ledger with the same claim rules as the Postgres table: unique
/// event id, unique payment reference, lease-based takeover.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<LedgerRow>>,
    failing_completions: AtomicU32,
}

impl MemoryLedger {
    /// Snapshot of every row.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.rows).iter().map(|row| row.entry.clone()).collect()
    }

    /// Fail the next `count` calls to `mark_completed`, leaving the row in
    /// `processing`.
    pub fn fail_next_completions(&self, count: u32) {
        self.failing_completions.store(count, Ordering::SeqCst);
    }

    /// Backdate a row so its claim looks abandoned.
    pub fn age_row(&self, event_id: &PaymentEventId, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(row) = lock(&self.rows)
            .iter_mut()
            .find(|row| &row.entry.event_id == event_id)
        {
            row.entry.updated_at -= by;
        }
    }

    fn update_claimed(
        &self,
        token: &ClaimToken,
        status: EventStatus,
        order_id: Option<&OrderId>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|row| {
                &row.entry.event_id == token.event_id()
                    && row.token.as_ref() == Some(token)
                    && row.entry.status == EventStatus::Processing
            })
            .ok_or_else(|| {
                RepositoryError::Conflict(format!(
                    "claim on {} is no longer held",
                    token.event_id()
                ))
            })?;

        let now = Utc::now();
        row.entry.status = status;
        if let Some(order_id) = order_id {
            row.entry.order_id = Some(order_id.clone());
        }
        row.entry.last_error = error.map(str::to_string);
        if status == EventStatus::Completed {
            row.entry.mirror_pending = true;
            row.entry.completed_at = Some(now);
        }
        row.entry.updated_at = now;
        row.token = None;
        Ok(())
    }
}

#[async_trait]
impl EventLedger for MemoryLedger {
    async fn claim(&self, claim: &NewClaim, lease: Duration) -> Result<Claim, RepositoryError> {
        let mut rows = lock(&self.rows);
        let now = Utc::now();

        let Some(row) = rows.iter_mut().find(|row| {
            row.entry.event_id == claim.event_id
                || row.entry.payment_reference == claim.payment_reference
        }) else {
            let token = ClaimToken::new(claim.event_id.clone());
            rows.push(LedgerRow {
                entry: LedgerEntry {
                    event_id: claim.event_id.clone(),
                    payment_reference: claim.payment_reference.clone(),
                    event_type: claim.event_type.clone(),
                    cart_id: claim.cart_id.clone(),
                    status: EventStatus::Processing,
                    attempts: 1,
                    captured: claim.captured,
                    carrier: claim.carrier.clone(),
                    order_id: None,
                    mirror_pending: false,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                },
                token: Some(token.clone()),
            });
            return Ok(Claim::Acquired(token));
        };

        let stale = (now - row.entry.updated_at)
            .to_std()
            .is_ok_and(|age| age > lease);
        let takeover = row.entry.status == EventStatus::Failed
            || (row.entry.status == EventStatus::Processing && stale);
        if takeover {
            let token = ClaimToken::new(row.entry.event_id.clone());
            row.entry.status = EventStatus::Processing;
            row.entry.attempts += 1;
            row.entry.updated_at = now;
            row.token = Some(token.clone());
            return Ok(Claim::Acquired(token));
        }

        Ok(match row.entry.status {
            EventStatus::Completed => Claim::Completed(row.entry.clone()),
            EventStatus::Rejected => Claim::Rejected(row.entry.clone()),
            EventStatus::Processing | EventStatus::Failed => Claim::InFlight,
        })
    }

    async fn mark_completed(
        &self,
        token: &ClaimToken,
        order_id: &OrderId,
    ) -> Result<(), RepositoryError> {
        let failing = self
            .failing_completions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepositoryError::Conflict("ledger write timed out".to_string()));
        }
        self.update_claimed(token, EventStatus::Completed, Some(order_id), None)
    }

    async fn mark_failed(&self, token: &ClaimToken, error: &str) -> Result<(), RepositoryError> {
        self.update_claimed(token, EventStatus::Failed, None, Some(error))
    }

    async fn mark_rejected(
        &self,
        token: &ClaimToken,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        self.update_claimed(token, EventStatus::Rejected, None, Some(reason))
    }

    async fn mark_mirrored(&self, event_id: &PaymentEventId) -> Result<(), RepositoryError> {
        if let Some(row) = lock(&self.rows).iter_mut().find(|row| {
            &row.entry.event_id == event_id && row.entry.status == EventStatus::Completed
        }) {
            row.entry.mirror_pending = false;
            row.entry.last_error = None;
            row.entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn note_mirror_failure(
        &self,
        event_id: &PaymentEventId,
        error: &str,
    ) -> Result<(), RepositoryError> {
        if let Some(row) = lock(&self.rows)
            .iter_mut()
            .find(|row| &row.entry.event_id == event_id)
        {
            row.entry.last_error = Some(error.to_string());
            row.entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find(
        &self,
        event_id: &PaymentEventId,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        Ok(lock(&self.rows)
            .iter()
            .find(|row| &row.entry.event_id == event_id)
            .map(|row| row.entry.clone()))
    }

    async fn find_by_cart(&self, cart_id: &CartId) -> Result<Option<LedgerEntry>, RepositoryError> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|row| &row.entry.cart_id == cart_id)
            .max_by_key(|row| {
                (
                    row.entry.status == EventStatus::Completed,
                    row.entry.updated_at,
                )
            })
            .map(|row| row.entry.clone()))
    }

    async fn list_by_cart(&self, cart_id: &CartId) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let mut entries: Vec<LedgerEntry> = lock(&self.rows)
            .iter()
            .filter(|row| &row.entry.cart_id == cart_id)
            .map(|row| row.entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn complete_from_mirror(
        &self,
        event_id: &PaymentEventId,
        order_id: &OrderId,
    ) -> Result<bool, RepositoryError> {
        let mut rows = lock(&self.rows);
        let Some(row) = rows.iter_mut().find(|row| {
            &row.entry.event_id == event_id && row.entry.status == EventStatus::Processing
        }) else {
            return Ok(false);
        };

        let now = Utc::now();
        row.entry.status = EventStatus::Completed;
        row.entry.order_id = Some(order_id.clone());
        row.entry.mirror_pending = false;
        row.entry.last_error = None;
        row.entry.completed_at.get_or_insert(now);
        row.entry.updated_at = now;
        row.token = None;
        Ok(true)
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let mut entries: Vec<LedgerEntry> = lock(&self.rows)
            .iter()
            .filter(|row| status.is_none_or(|status| row.entry.status == status))
            .map(|row| row.entry.clone())
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }

    async fn list_mirror_pending(&self, limit: i64) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let mut entries: Vec<LedgerEntry> = lock(&self.rows)
            .iter()
            .filter(|row| row.entry.status == EventStatus::Completed && row.entry.mirror_pending)
            .map(|row| row.entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.updated_at);
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }

    async fn release(&self, event_id: &PaymentEventId) -> Result<LedgerEntry, RepositoryError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|row| &row.entry.event_id == event_id)
            .ok_or(RepositoryError::NotFound)?;

        match row.entry.status {
            EventStatus::Rejected | EventStatus::Failed => {
                row.entry.status = EventStatus::Failed;
                row.entry.updated_at = Utc::now();
                row.token = None;
                Ok(row.entry.clone())
            }
            status => Err(RepositoryError::Conflict(format!(
                "event {event_id} is {status} and cannot be released"
            ))),
        }
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Notifier that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Make every notification fail.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Api {
                status: 500,
                message: "notification service down".to_string(),
            });
        }
        lock(&self.sent).push(notification.clone());
        Ok(())
    }
}
