//! Redline storefront - checkout and order pipeline.
//!
//! This binary serves the checkout API and the payment webhook on port 3000.
//!
//! # Architecture
//!
//! - Axum JSON API, rate limited per client IP on public routes
//! - Commerce backend as the pricing authority and order store
//! - Stripe for payment sessions and signed webhooks
//! - Sanity as a read mirror for internal dashboards and quote requests
//! - `PostgreSQL` event ledger (`redline_storefront`) for at-most-once
//!   order creation
//!
//! # Security
//!
//! Prices are never accepted from clients. Webhooks are processed only after
//! signature verification.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::Request;
use axum::{Router, middleware::from_fn};
use redline_storefront::config::StorefrontConfig;
use redline_storefront::state::{AppState, Backends};
use redline_storefront::{db, middleware, routes};
use sentry::integrations::tracing as sentry_tracing;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &StorefrontConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "redline_storefront=info,tower_http=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init).
    // A configuration error is fatal: the handlers never start.
    let config = StorefrontConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);
    init_tracing(config.json_logs);

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");
    tracing::info!("Database pool created");

    // NOTE: Migrations are NOT run automatically on startup.
    // Run them explicitly via: cargo run -p redline-cli -- migrate

    let backends = Backends::from_config(&config, pool).expect("Failed to build API clients");
    let state = AppState::new(&config, backends);

    let rate_limiter =
        middleware::public_rate_limiter().expect("Public rate limiter quota is valid");

    let app = Router::new()
        .merge(routes::health_routes())
        .merge(routes::webhook_routes())
        .merge(routes::public_routes().layer(rate_limiter))
        .with_state(state)
        .layer(from_fn(middleware::security_headers_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    let addr = config.socket_addr();
    tracing::info!("storefront listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
