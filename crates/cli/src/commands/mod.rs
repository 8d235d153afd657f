//! CLI commands.

pub mod events;
pub mod migrate;

use redline_core::IdError;
use redline_storefront::config::ConfigError;
use redline_storefront::db::RepositoryError;
use redline_storefront::services::ReconcileError;
use redline_storefront::state::StateError;
use secrecy::SecretString;
use thiserror::Error;

/// Errors that can occur while running a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// Required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// Database connection error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Ledger operation failed.
    #[error("Ledger error: {0}")]
    Repository(#[from] RepositoryError),

    /// Storefront configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// API clients could not be built.
    #[error("Client error: {0}")]
    State(#[from] StateError),

    /// Remirror run failed.
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Malformed event id.
    #[error("Invalid event id: {0}")]
    InvalidEventId(#[from] IdError),

    /// Unknown status filter.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
}

/// Storefront database URL from `STOREFRONT_DATABASE_URL`, falling back to
/// `DATABASE_URL`.
fn database_url() -> Result<SecretString, CliError> {
    dotenvy::dotenv().ok();

    std::env::var("STOREFRONT_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map(SecretString::from)
        .map_err(|_| CliError::MissingEnvVar("STOREFRONT_DATABASE_URL"))
}
