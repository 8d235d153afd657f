//! Core types for Redline.
//!
//! This module provides type-safe wrappers for the checkout domain.

pub mod authority;
pub mod cart;
pub mod checkout;
pub mod email;
pub mod id;
pub mod order;
pub mod payment;
pub mod price;
pub mod quote;
pub mod status;

pub use authority::NonAuthoritative;
pub use cart::{
    CachedCart, CachedLine, Carrier, FulfillmentMethod, LineItem, PricedCart, SelectedOption,
};
pub use checkout::{CheckoutSession, MetadataError, PaymentLineEntry, SessionMetadata, sum_entries};
pub use email::{Email, EmailError};
pub use id::*;
pub use order::{AuthoritativeOrder, MirrorOrder, OrderRepresentation};
pub use payment::{PaymentEvent, PaymentEventKind, PaymentSucceeded};
pub use price::{CurrencyCode, Money, MoneyError};
pub use quote::{
    Contact, ContactInfo, NewQuoteRequest, QuoteKind, QuoteLine, QuoteRequest, QuoteValidationError,
    VehicleInfo,
};
pub use status::*;
