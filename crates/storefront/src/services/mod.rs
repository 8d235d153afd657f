//! Pipeline services.
//!
//! # Services
//!
//! - `pricing` - Live cart totals, the only source of transaction amounts
//! - `checkout` - Fulfillment selection and payment session creation
//! - `receiver` - Webhook verification and dispatch
//! - `reconciler` - Payment to order, at most once per payment
//! - `quotes` - Quote and wholesale request intake
//! - `notify` / `klaviyo` - Best-effort customer notifications
//! - `retry` - Bounded backoff for idempotent downstream calls

pub mod checkout;
pub mod klaviyo;
pub mod notify;
pub mod pricing;
pub mod quotes;
pub mod receiver;
pub mod reconciler;
pub mod retry;

pub use checkout::{CheckoutError, CheckoutSessionBuilder};
pub use klaviyo::KlaviyoClient;
pub use notify::{NoopNotifier, Notification, Notifier, NotifyError};
pub use pricing::{PricingAuthority, PricingError};
pub use quotes::{QuoteError, QuoteIntake};
pub use receiver::{PaymentEventReceiver, ReceiverError, ReceiverOutcome};
pub use reconciler::{
    MirrorStatus, OrderReconciler, ReconcileError, Reconciliation, RemirrorReport,
    SucceededPayment,
};
pub use retry::{RetryPolicy, Transient};
