//! Payment event ledger commands.
//!
//! # Environment Variables
//!
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string
//! - `remirror` also needs the full storefront configuration, since it writes
//!   to the content store

use std::str::FromStr;

use redline_core::{EventStatus, PaymentEventId};
use redline_storefront::config::StorefrontConfig;
use redline_storefront::db::{self, EventLedger, LedgerEntry, PgEventLedger};
use redline_storefront::state::{AppState, Backends};

use super::{CliError, database_url};

async fn ledger() -> Result<PgEventLedger, CliError> {
    let database_url = database_url()?;
    let pool = db::create_pool(&database_url).await?;
    Ok(PgEventLedger::new(pool))
}

fn format_entry(entry: &LedgerEntry) -> String {
    format!(
        "{event}  {status:<10}  attempts={attempts}  cart={cart}  order={order}  captured={captured}  mirror_pending={pending}  updated={updated}{error}",
        event = entry.event_id,
        status = entry.status,
        attempts = entry.attempts,
        cart = entry.cart_id,
        order = entry.order_id.as_ref().map_or("-", |id| id.as_str()),
        captured = entry.captured,
        pending = entry.mirror_pending,
        updated = entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
        error = entry
            .last_error
            .as_ref()
            .map_or_else(String::new, |e| format!("  last_error={e:?}")),
    )
}

/// Print ledger entries.
///
/// # Errors
///
/// Returns an error for an unknown status or a database failure.
pub async fn list(status: Option<&str>, limit: i64) -> Result<(), CliError> {
    let status = status
        .map(EventStatus::from_str)
        .transpose()
        .map_err(CliError::InvalidStatus)?;

    let entries = ledger().await?.list(status, limit).await?;

    #[allow(clippy::print_stdout)]
    {
        if entries.is_empty() {
            println!("No ledger entries");
        }
        for entry in &entries {
            println!("{}", format_entry(entry));
        }
    }
    Ok(())
}

/// Make a parked entry claimable again.
///
/// # Errors
///
/// Returns an error if the entry does not exist or is not `rejected` or
/// `failed`.
pub async fn release(event_id: &str) -> Result<(), CliError> {
    let event_id = PaymentEventId::parse(event_id)?;
    let entry = ledger().await?.release(&event_id).await?;

    tracing::info!(
        event_id = %entry.event_id,
        cart_id = %entry.cart_id,
        "Entry released; the next delivery of this payment will reconcile it"
    );
    Ok(())
}

/// Re-create pending mirrors.
///
/// # Errors
///
/// Returns an error if configuration, clients or the ledger fail.
pub async fn remirror(limit: i64) -> Result<(), CliError> {
    let config = StorefrontConfig::from_env()?;
    let pool = db::create_pool(&config.database_url).await?;
    let state = AppState::new(&config, Backends::from_config(&config, pool)?);

    let report = state.reconciler().remirror_pending(limit).await?;

    #[allow(clippy::print_stdout)]
    {
        println!(
            "Mirrored: {}  Still pending: {}",
            report.mirrored, report.pending
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use redline_core::{CartId, CurrencyCode, Money, OrderId, PaymentReference};

    use super::*;

    #[test]
    fn test_format_entry() {
        let now = Utc::now();
        let entry = LedgerEntry {
            event_id: PaymentEventId::parse("evt_1").unwrap(),
            payment_reference: PaymentReference::parse("pi_1").unwrap(),
            event_type: "payment_intent.succeeded".to_string(),
            cart_id: CartId::parse("cart_01").unwrap(),
            status: EventStatus::Rejected,
            attempts: 1,
            captured: Money::from_minor(10500, CurrencyCode::USD),
            carrier: None,
            order_id: None::<OrderId>,
            mirror_pending: false,
            last_error: Some("amount mismatch".to_string()),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let line = format_entry(&entry);
        assert!(line.starts_with("evt_1  rejected"));
        assert!(line.contains("order=-"));
        assert!(line.contains("captured=105.00 USD"));
        assert!(line.contains("last_error=\"amount mismatch\""));
    }
}
