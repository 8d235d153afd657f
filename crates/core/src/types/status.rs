//! Status enums for orders, quote requests and payment events.

use serde::{Deserialize, Serialize};

/// Order fulfillment status as reported by the commerce backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    #[default]
    NotFulfilled,
    PartiallyFulfilled,
    Fulfilled,
    Shipped,
    Delivered,
    Canceled,
}

/// Order financial status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinancialStatus {
    #[default]
    Pending,
    Authorized,
    Captured,
    PartiallyRefunded,
    Refunded,
    Canceled,
}

/// Lifecycle of a quote request. Transitions past `New` are driven by staff
/// in the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    #[default]
    New,
    Sent,
    Accepted,
    Declined,
    Archived,
}

/// Processing state of a payment event in the local event ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Claimed by a worker; reconciliation in progress.
    Processing,
    /// An order exists for this payment.
    Completed,
    /// A transient failure ended the last attempt; safe to retry.
    Failed,
    /// Amount or metadata check failed; needs manual review.
    Rejected,
}

impl EventStatus {
    /// Whether an automatic redelivery may pick this event up again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Lower-case database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("invalid event status: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_status_roundtrips_through_str() {
        for status in [
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::Failed,
            EventStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("done".parse::<EventStatus>().is_err());
    }

    #[test]
    fn test_only_failed_is_retryable() {
        assert!(EventStatus::Failed.is_retryable());
        assert!(!EventStatus::Rejected.is_retryable());
        assert!(!EventStatus::Processing.is_retryable());
    }

    #[test]
    fn test_quote_status_serde() {
        assert_eq!(serde_json::to_string(&QuoteStatus::New).unwrap(), "\"new\"");
    }
}
