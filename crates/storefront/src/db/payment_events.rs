//! Payment event ledger.
//!
//! Every successful payment event is claimed here before the reconciler
//! touches the commerce backend. The claim is an `INSERT ... ON CONFLICT DO
//! NOTHING` against a table keyed by event id with a unique payment
//! reference, so two concurrent deliveries of the same payment (same event
//! id, or a different event type for the same payment) cannot both win.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redline_core::{
    AuthoritativeOrder, CartId, Carrier, CurrencyCode, EventStatus, MirrorOrder, Money, OrderId,
    PaymentEventId, PaymentReference,
};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::RepositoryError;

const ENTRY_COLUMNS: &str = "event_id, payment_reference, event_type, cart_id, status, attempts, \
     captured_minor, currency, carrier, order_id, mirror_pending, last_error, \
     created_at, updated_at, completed_at";

// =============================================================================
// Types
// =============================================================================

/// What the reconciler records when it first sees a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClaim {
    /// Payment event id.
    pub event_id: PaymentEventId,
    /// Processor payment reference.
    pub payment_reference: PaymentReference,
    /// Raw event type.
    pub event_type: String,
    /// Cart the payment is for.
    pub cart_id: CartId,
    /// Amount the processor captured.
    pub captured: Money,
    /// Carrier chosen at checkout.
    pub carrier: Option<Carrier>,
}

/// Proof that the holder owns the `processing` claim on a ledger row.
///
/// Updates made with a token that has since been superseded by a lease
/// takeover fail with [`RepositoryError::Conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    event_id: PaymentEventId,
    token: Uuid,
}

impl ClaimToken {
    /// Mint a fresh token for the row keyed by `event_id`.
    #[must_use]
    pub fn new(event_id: PaymentEventId) -> Self {
        Self {
            event_id,
            token: Uuid::new_v4(),
        }
    }

    /// Key of the claimed row. May differ from the delivered event's id when
    /// a second event type for the same payment re-claims a failed row.
    #[must_use]
    pub const fn event_id(&self) -> &PaymentEventId {
        &self.event_id
    }
}

/// Result of trying to claim a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the payment; proceed with reconciliation.
    Acquired(ClaimToken),
    /// An order already exists for this payment.
    Completed(LedgerEntry),
    /// Another worker holds a fresh claim.
    InFlight,
    /// An earlier attempt hit a consistency error; needs an operator.
    Rejected(LedgerEntry),
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Row key.
    pub event_id: PaymentEventId,
    /// Processor payment reference.
    pub payment_reference: PaymentReference,
    /// Event type of the first delivery.
    pub event_type: String,
    /// Cart the payment is for.
    pub cart_id: CartId,
    /// Processing state.
    pub status: EventStatus,
    /// Number of claims taken on this row.
    pub attempts: i32,
    /// Amount the processor captured.
    pub captured: Money,
    /// Carrier chosen at checkout.
    pub carrier: Option<Carrier>,
    /// Authoritative order id, once completed.
    pub order_id: Option<OrderId>,
    /// The content-store mirror has not been confirmed yet.
    pub mirror_pending: bool,
    /// Last failure or rejection reason.
    pub last_error: Option<String>,
    /// First seen.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// When the order was completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Rebuild the mirror for a completed entry. `None` until an order
    /// exists.
    #[must_use]
    pub fn to_mirror(&self) -> Option<MirrorOrder> {
        let order_id = self.order_id.clone()?;
        let order = AuthoritativeOrder {
            id: order_id,
            source_cart_id: self.cart_id.clone(),
            total: self.captured,
            payment_reference: self.payment_reference.clone(),
        };
        Some(MirrorOrder::of(
            &order,
            self.event_id.clone(),
            self.carrier.clone(),
            self.completed_at.unwrap_or(self.updated_at),
        ))
    }
}

// =============================================================================
// Ledger trait
// =============================================================================

/// Durable record of payment processing state.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Claim a payment for reconciliation.
    ///
    /// A row in `failed`, or in `processing` for longer than `lease`, is
    /// taken over. Any other existing row is reported as it is.
    async fn claim(&self, claim: &NewClaim, lease: Duration) -> Result<Claim, RepositoryError>;

    /// Record the authoritative order. Leaves the mirror pending.
    async fn mark_completed(
        &self,
        token: &ClaimToken,
        order_id: &OrderId,
    ) -> Result<(), RepositoryError>;

    /// Release the claim after a transient failure so a redelivery retries.
    async fn mark_failed(&self, token: &ClaimToken, error: &str) -> Result<(), RepositoryError>;

    /// Park the payment after a consistency error.
    async fn mark_rejected(&self, token: &ClaimToken, reason: &str)
    -> Result<(), RepositoryError>;

    /// The mirror exists in the content store.
    async fn mark_mirrored(&self, event_id: &PaymentEventId) -> Result<(), RepositoryError>;

    /// The mirror write failed; keep it pending and record why.
    async fn note_mirror_failure(
        &self,
        event_id: &PaymentEventId,
        error: &str,
    ) -> Result<(), RepositoryError>;

    /// Look up one row.
    async fn find(&self, event_id: &PaymentEventId)
    -> Result<Option<LedgerEntry>, RepositoryError>;

    /// Latest row for a cart, completed rows first.
    async fn find_by_cart(&self, cart_id: &CartId) -> Result<Option<LedgerEntry>, RepositoryError>;

    /// Every row recorded for a cart, oldest first.
    async fn list_by_cart(&self, cart_id: &CartId) -> Result<Vec<LedgerEntry>, RepositoryError>;

    /// Complete a row left in `processing` whose order is already proven by
    /// its mirror. Returns `false` when the row was not in `processing`.
    async fn complete_from_mirror(
        &self,
        event_id: &PaymentEventId,
        order_id: &OrderId,
    ) -> Result<bool, RepositoryError>;

    /// Most recently updated rows, optionally filtered by status.
    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, RepositoryError>;

    /// Completed rows whose mirror has not been confirmed.
    async fn list_mirror_pending(&self, limit: i64) -> Result<Vec<LedgerEntry>, RepositoryError>;

    /// Make a `rejected` or `failed` row claimable again.
    async fn release(&self, event_id: &PaymentEventId) -> Result<LedgerEntry, RepositoryError>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

// =============================================================================
// Internal Row Types
// =============================================================================

/// Internal row type for `PostgreSQL` payment event queries.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    payment_reference: String,
    event_type: String,
    cart_id: String,
    status: String,
    attempts: i32,
    captured_minor: i64,
    currency: String,
    carrier: Option<String>,
    order_id: Option<String>,
    mirror_pending: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::DataCorruption(format!("invalid {what} in database: {e}"))
}

impl TryFrom<EventRow> for LedgerEntry {
    type Error = RepositoryError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let currency: CurrencyCode = row.currency.parse().map_err(|e| corrupt("currency", e))?;
        Ok(Self {
            event_id: PaymentEventId::parse(&row.event_id).map_err(|e| corrupt("event id", e))?,
            payment_reference: PaymentReference::parse(&row.payment_reference)
                .map_err(|e| corrupt("payment reference", e))?,
            event_type: row.event_type,
            cart_id: CartId::parse(&row.cart_id).map_err(|e| corrupt("cart id", e))?,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            attempts: row.attempts,
            captured: Money::from_minor(row.captured_minor, currency),
            carrier: row.carrier.as_deref().map(Carrier::new),
            order_id: row
                .order_id
                .as_deref()
                .map(OrderId::parse)
                .transpose()
                .map_err(|e| corrupt("order id", e))?,
            mirror_pending: row.mirror_pending,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// `PostgreSQL` implementation of [`EventLedger`].
#[derive(Debug, Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    /// Create a new ledger over a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_existing(&self, claim: &NewClaim) -> Result<Option<LedgerEntry>, RepositoryError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events \
             WHERE event_id = $1 OR payment_reference = $2 \
             LIMIT 1"
        ))
        .bind(claim.event_id.as_str())
        .bind(claim.payment_reference.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Apply a status change guarded by the claim token.
    async fn update_claimed(
        &self,
        token: &ClaimToken,
        status: EventStatus,
        order_id: Option<&OrderId>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE storefront.payment_events
            SET status = $3,
                order_id = COALESCE($4, order_id),
                last_error = $5,
                mirror_pending = CASE WHEN $3 = 'completed' THEN TRUE ELSE mirror_pending END,
                completed_at = CASE WHEN $3 = 'completed' THEN NOW() ELSE completed_at END,
                claim_token = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND claim_token = $2 AND status = 'processing'
            ",
        )
        .bind(token.event_id.as_str())
        .bind(token.token)
        .bind(status.as_str())
        .bind(order_id.map(OrderId::as_str))
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %token.event_id, status = %status, "Claim no longer held");
            return Err(RepositoryError::Conflict(format!(
                "claim on {} is no longer held",
                token.event_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    #[instrument(skip(self, claim), fields(event_id = %claim.event_id, payment_reference = %claim.payment_reference))]
    async fn claim(&self, claim: &NewClaim, lease: Duration) -> Result<Claim, RepositoryError> {
        let token = Uuid::new_v4();

        let inserted: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO storefront.payment_events (
                event_id, payment_reference, event_type, cart_id, status,
                claim_token, captured_minor, currency, carrier
            )
            VALUES ($1, $2, $3, $4, 'processing', $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING event_id
            ",
        )
        .bind(claim.event_id.as_str())
        .bind(claim.payment_reference.as_str())
        .bind(&claim.event_type)
        .bind(claim.cart_id.as_str())
        .bind(token)
        .bind(claim.captured.minor_units)
        .bind(claim.captured.currency.code())
        .bind(claim.carrier.as_ref().map(Carrier::as_str))
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            debug!("New claim");
            return Ok(Claim::Acquired(ClaimToken {
                event_id: claim.event_id.clone(),
                token,
            }));
        }

        let taken_over: Option<String> = sqlx::query_scalar(
            r"
            UPDATE storefront.payment_events
            SET status = 'processing',
                claim_token = $3,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE (event_id = $1 OR payment_reference = $2)
              AND (status = 'failed'
                   OR (status = 'processing' AND updated_at < NOW() - make_interval(secs => $4)))
            RETURNING event_id
            ",
        )
        .bind(claim.event_id.as_str())
        .bind(claim.payment_reference.as_str())
        .bind(token)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(event_id) = taken_over {
            debug!(row = %event_id, "Took over stale or failed claim");
            return Ok(Claim::Acquired(ClaimToken {
                event_id: PaymentEventId::parse(&event_id).map_err(|e| corrupt("event id", e))?,
                token,
            }));
        }

        let existing = self.fetch_existing(claim).await?.ok_or_else(|| {
            RepositoryError::DataCorruption("conflicting payment event row vanished".to_string())
        })?;

        Ok(match existing.status {
            EventStatus::Completed => Claim::Completed(existing),
            EventStatus::Rejected => Claim::Rejected(existing),
            EventStatus::Processing | EventStatus::Failed => Claim::InFlight,
        })
    }

    #[instrument(skip(self), fields(event_id = %token.event_id, order_id = %order_id))]
    async fn mark_completed(
        &self,
        token: &ClaimToken,
        order_id: &OrderId,
    ) -> Result<(), RepositoryError> {
        self.update_claimed(token, EventStatus::Completed, Some(order_id), None)
            .await
    }

    #[instrument(skip(self), fields(event_id = %token.event_id))]
    async fn mark_failed(&self, token: &ClaimToken, error: &str) -> Result<(), RepositoryError> {
        self.update_claimed(token, EventStatus::Failed, None, Some(error))
            .await
    }

    #[instrument(skip(self), fields(event_id = %token.event_id))]
    async fn mark_rejected(
        &self,
        token: &ClaimToken,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        self.update_claimed(token, EventStatus::Rejected, None, Some(reason))
            .await
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn mark_mirrored(&self, event_id: &PaymentEventId) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            UPDATE storefront.payment_events
            SET mirror_pending = FALSE, last_error = NULL, updated_at = NOW()
            WHERE event_id = $1 AND status = 'completed'
            ",
        )
        .bind(event_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn note_mirror_failure(
        &self,
        event_id: &PaymentEventId,
        error: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            UPDATE storefront.payment_events
            SET last_error = $2, updated_at = NOW()
            WHERE event_id = $1
            ",
        )
        .bind(event_id.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        event_id: &PaymentEventId,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events WHERE event_id = $1"
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_cart(&self, cart_id: &CartId) -> Result<Option<LedgerEntry>, RepositoryError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events \
             WHERE cart_id = $1 \
             ORDER BY (status = 'completed') DESC, updated_at DESC \
             LIMIT 1"
        ))
        .bind(cart_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_by_cart(&self, cart_id: &CartId) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events \
             WHERE cart_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(cart_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id, order_id = %order_id))]
    async fn complete_from_mirror(
        &self,
        event_id: &PaymentEventId,
        order_id: &OrderId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE storefront.payment_events
            SET status = 'completed',
                order_id = $2,
                mirror_pending = FALSE,
                last_error = NULL,
                completed_at = COALESCE(completed_at, NOW()),
                claim_token = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND status = 'processing'
            ",
        )
        .bind(event_id.as_str())
        .bind(order_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY updated_at DESC \
             LIMIT $2"
        ))
        .bind(status.map(EventStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_mirror_pending(&self, limit: i64) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM storefront.payment_events \
             WHERE status = 'completed' AND mirror_pending \
             ORDER BY updated_at ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn release(&self, event_id: &PaymentEventId) -> Result<LedgerEntry, RepositoryError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "UPDATE storefront.payment_events \
             SET status = 'failed', claim_token = NULL, updated_at = NOW() \
             WHERE event_id = $1 AND status IN ('rejected', 'failed') \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.find(event_id).await? {
                Some(entry) => Err(RepositoryError::Conflict(format!(
                    "event {event_id} is {} and cannot be released",
                    entry.status
                ))),
                None => Err(RepositoryError::NotFound),
            },
        }
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(status: &str) -> EventRow {
        EventRow {
            event_id: "evt_1".to_string(),
            payment_reference: "pi_1".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            cart_id: "cart_01".to_string(),
            status: status.to_string(),
            attempts: 1,
            captured_minor: 10500,
            currency: "USD".to_string(),
            carrier: Some("ups".to_string()),
            order_id: Some("order_1".to_string()),
            mirror_pending: true,
            last_error: None,
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            updated_at: DateTime::from_timestamp(1_700_000_060, 0).unwrap(),
            completed_at: Some(DateTime::from_timestamp(1_700_000_060, 0).unwrap()),
        }
    }

    #[test]
    fn test_row_conversion() {
        let entry = LedgerEntry::try_from(row("completed")).unwrap();
        assert_eq!(entry.status, EventStatus::Completed);
        assert_eq!(entry.captured, Money::from_minor(10500, CurrencyCode::USD));
        assert_eq!(entry.order_id.unwrap().as_str(), "order_1");
    }

    #[test]
    fn test_unknown_status_is_corruption() {
        assert!(matches!(
            LedgerEntry::try_from(row("paid")),
            Err(RepositoryError::DataCorruption(_))
        ));
    }

    #[test]
    fn test_to_mirror_requires_order() {
        let entry = LedgerEntry::try_from(row("completed")).unwrap();
        let mirror = entry.to_mirror().unwrap();
        assert!(!mirror.is_authoritative());
        assert_eq!(mirror.total_minor_units, 10500);
        assert_eq!(mirror.created_at, entry.completed_at.unwrap());

        let pending = LedgerEntry {
            order_id: None,
            ..entry
        };
        assert!(pending.to_mirror().is_none());
    }
}
