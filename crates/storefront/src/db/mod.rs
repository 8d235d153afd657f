//! Database operations for storefront `PostgreSQL`.
//!
//! # Database: `redline_storefront`
//!
//! Carts, prices and orders live in the commerce backend. The storefront
//! database holds only the payment event ledger.
//!
//! ## Tables
//!
//! - `storefront.payment_events` - One row per payment; the uniqueness
//!   constraint behind at-most-once order creation
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p redline-cli -- migrate
//! ```

pub mod payment_events;

use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::services::retry::Transient;

pub use payment_events::{
    Claim, ClaimToken, EventLedger, LedgerEntry, NewClaim, PgEventLedger,
};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// The row is not in a state that allows the operation (e.g. a claim was
    /// taken over by another worker).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl Transient for RepositoryError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            )
        )
    }
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
