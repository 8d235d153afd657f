//! Newtype IDs for type-safe references to records owned by external systems.
//!
//! Carts, orders, fulfillment methods and payment events are identified by
//! opaque strings minted by the commerce backend or the payment processor.
//! Use the `define_id!` macro to create wrappers that prevent accidentally
//! passing a cart id where a payment reference is expected.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing an opaque ID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    /// The input is empty or only whitespace.
    #[error("{kind} cannot be empty")]
    Empty {
        /// Human-readable ID kind.
        kind: &'static str,
    },
    /// The input is longer than [`MAX_ID_LENGTH`].
    #[error("{kind} must be at most {max} characters")]
    TooLong {
        /// Human-readable ID kind.
        kind: &'static str,
        /// Maximum allowed length.
        max: usize,
    },
    /// The input contains whitespace or control characters.
    #[error("{kind} contains invalid characters")]
    InvalidCharacters {
        /// Human-readable ID kind.
        kind: &'static str,
    },
}

/// Maximum length accepted for any opaque ID.
pub const MAX_ID_LENGTH: usize = 255;

/// Validate an opaque ID string.
///
/// # Errors
///
/// Returns an error if the value is empty, too long, or contains whitespace
/// or control characters.
pub fn validate_opaque_id(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.trim().is_empty() {
        return Err(IdError::Empty { kind });
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(IdError::TooLong {
            kind,
            max: MAX_ID_LENGTH,
        });
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdError::InvalidCharacters { kind });
    }
    Ok(())
}

/// Macro to define a type-safe opaque string ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize`/`Deserialize` with `#[serde(try_from = "String")]` so
///   malformed IDs are rejected at the edge
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`
/// - `parse()`, `as_str()` and `into_inner()`
/// - `sqlx` `Type`, `Encode`, and `Decode` implementations (with `postgres` feature)
///
/// # Example
///
/// ```rust
/// # use redline_core::define_id;
/// define_id!(CartId, "cart id");
/// define_id!(OrderId, "order id");
///
/// let cart_id = CartId::parse("cart_01J").unwrap();
/// assert_eq!(cart_id.as_str(), "cart_01J");
/// assert!(CartId::parse("  ").is_err());
///
/// // These are different types, so this won't compile:
/// // let _: OrderId = cart_id;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse an ID from a string.
            ///
            /// # Errors
            ///
            /// Returns an error if the value is not a valid opaque ID.
            pub fn parse(value: &str) -> ::core::result::Result<Self, $crate::types::id::IdError> {
                $crate::types::id::validate_opaque_id($kind, value)?;
                Ok(Self(value.to_owned()))
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the ID and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl ::core::convert::TryFrom<String> for $name {
            type Error = $crate::types::id::IdError;

            fn try_from(value: String) -> ::core::result::Result<Self, Self::Error> {
                $crate::types::id::validate_opaque_id($kind, &value)?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl ::core::str::FromStr for $name {
            type Err = $crate::types::id::IdError;

            fn from_str(s: &str) -> ::core::result::Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        #[cfg(feature = "postgres")]
        impl ::sqlx::Type<::sqlx::Postgres> for $name {
            fn type_info() -> ::sqlx::postgres::PgTypeInfo {
                <String as ::sqlx::Type<::sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &::sqlx::postgres::PgTypeInfo) -> bool {
                <String as ::sqlx::Type<::sqlx::Postgres>>::compatible(ty)
            }
        }

        #[cfg(feature = "postgres")]
        impl<'r> ::sqlx::Decode<'r, ::sqlx::Postgres> for $name {
            fn decode(
                value: ::sqlx::postgres::PgValueRef<'r>,
            ) -> ::core::result::Result<Self, ::sqlx::error::BoxDynError> {
                let raw = <String as ::sqlx::Decode<::sqlx::Postgres>>::decode(value)?;
                Ok(Self::try_from(raw)?)
            }
        }

        #[cfg(feature = "postgres")]
        impl ::sqlx::Encode<'_, ::sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut ::sqlx::postgres::PgArgumentBuffer,
            ) -> ::std::result::Result<::sqlx::encode::IsNull, ::sqlx::error::BoxDynError> {
                <String as ::sqlx::Encode<::sqlx::Postgres>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

// Commerce backend
define_id!(CartId, "cart id");
define_id!(VariantId, "variant id");
define_id!(FulfillmentMethodId, "fulfillment method id");
define_id!(OrderId, "order id");

// Payment processor
define_id!(PaymentEventId, "payment event id");
define_id!(PaymentReference, "payment reference");
define_id!(CheckoutSessionId, "checkout session id");

/// Identifier of a quote request, minted locally at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteRequestId(Uuid);

impl QuoteRequestId {
    /// Generate a fresh random ID.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl core::fmt::Display for QuoteRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_id() {
        let id = CartId::parse("cart_01JABCDEF").unwrap();
        assert_eq!(id.as_str(), "cart_01JABCDEF");
        assert_eq!(id.to_string(), "cart_01JABCDEF");
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(matches!(CartId::parse(""), Err(IdError::Empty { .. })));
        assert!(matches!(CartId::parse("   "), Err(IdError::Empty { .. })));
        assert!(matches!(
            CartId::parse("cart 1"),
            Err(IdError::InvalidCharacters { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let long = "x".repeat(MAX_ID_LENGTH + 1);
        assert!(matches!(
            PaymentEventId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: PaymentEventId = serde_json::from_str("\"evt_123\"").unwrap();
        assert_eq!(ok.as_str(), "evt_123");

        let err = serde_json::from_str::<PaymentEventId>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_serialize_is_plain_string() {
        let id = OrderId::parse("order_9").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"order_9\"");
    }

    #[test]
    fn test_quote_request_ids_are_unique() {
        assert_ne!(QuoteRequestId::new_random(), QuoteRequestId::new_random());
    }
}
