//! Redline storefront library.
//!
//! Checkout, payment webhooks, order reconciliation and quote intake,
//! exposed as a library so the binary, the CLI and the integration tests
//! share one implementation.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod commerce;
pub mod config;
pub mod content_store;
pub mod db;
pub mod error;
pub mod middleware;
pub mod payments;
pub mod routes;
pub mod services;
pub mod state;
