//! Redline CLI - Database migrations and payment ledger tools.
//!
//! # Usage
//!
//! ```bash
//! # Run storefront database migrations
//! redline-cli migrate
//!
//! # Inspect the payment event ledger
//! redline-cli events list --status rejected --limit 20
//!
//! # Make a parked payment claimable again after investigating it
//! redline-cli events release evt_1NqGh2
//!
//! # Re-create content-store mirrors whose write failed
//! redline-cli events remirror --limit 100
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

use commands::CliError;

#[derive(Parser)]
#[command(name = "redline-cli")]
#[command(author, version, about = "Redline operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run storefront database migrations
    Migrate,
    /// Inspect and repair the payment event ledger
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// List ledger entries, most recently updated first
    List {
        /// Only entries in this status (`processing`, `completed`, `failed`, `rejected`)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum entries to show
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Move a rejected or failed entry back to a claimable state
    Release {
        /// Payment event id
        event_id: String,
    },
    /// Re-create missing content-store mirrors for completed payments
    Remirror {
        /// Maximum entries to process
        #[arg(short, long, default_value_t = 100)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Migrate => commands::migrate::storefront().await?,
        Commands::Events { action } => match action {
            EventsAction::List { status, limit } => {
                commands::events::list(status.as_deref(), limit).await?;
            }
            EventsAction::Release { event_id } => commands::events::release(&event_id).await?,
            EventsAction::Remirror { limit } => commands::events::remirror(limit).await?,
        },
    }
    Ok(())
}
