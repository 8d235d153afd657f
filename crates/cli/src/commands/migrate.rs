//! Database migration commands.
//!
//! # Environment Variables
//!
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string (falls back
//!   to `DATABASE_URL`)
//!
//! Migrations live in `crates/storefront/migrations/` and are embedded at
//! compile time.

use redline_storefront::db;

use super::{CliError, database_url};

/// Run storefront database migrations.
///
/// # Errors
///
/// Returns an error if the database is unreachable or a migration fails.
pub async fn storefront() -> Result<(), CliError> {
    let database_url = database_url()?;

    tracing::info!("Connecting to storefront database...");
    let pool = db::create_pool(&database_url).await?;

    tracing::info!("Running storefront migrations...");
    sqlx::migrate!("../storefront/migrations").run(&pool).await?;

    tracing::info!("Storefront migrations complete");
    Ok(())
}
