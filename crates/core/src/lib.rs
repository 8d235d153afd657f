//! Redline Core - Shared domain types for the checkout pipeline.
//!
//! This crate provides the types used across all Redline components:
//! - `storefront` - Checkout, payment webhooks, order reconciliation, quote intake
//! - `cli` - Migrations and manual reconciliation tools
//!
//! # Architecture
//!
//! The core crate contains only types, validation and pure computations - no
//! I/O, no database access, no HTTP clients. Prices are always held in integer
//! minor currency units so totals compare exactly.
//!
//! # Modules
//!
//! - [`types`] - Money, opaque IDs, cart cache, checkout sessions, payment
//!   events, order representations and quote requests

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
