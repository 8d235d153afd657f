//! Marker for data that must never be treated as a source of truth.
//!
//! Both the client-side cart cache and the content-store order mirror carry
//! this marker. It serializes as the literal `false` and refuses to
//! deserialize from `true`, so a record claiming authority is rejected at the
//! boundary instead of silently accepted.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Zero-sized "not authoritative" tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NonAuthoritative;

impl NonAuthoritative {
    /// Always `false`.
    #[must_use]
    pub const fn is_authoritative(self) -> bool {
        false
    }
}

impl Serialize for NonAuthoritative {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(false)
    }
}

impl<'de> Deserialize<'de> for NonAuthoritative {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Err(de::Error::custom(
                "record is tagged authoritative but only non-authoritative copies are accepted",
            ))
        } else {
            Ok(Self)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_false() {
        assert_eq!(serde_json::to_string(&NonAuthoritative).unwrap(), "false");
    }

    #[test]
    fn test_rejects_true() {
        assert!(serde_json::from_str::<NonAuthoritative>("false").is_ok());
        assert!(serde_json::from_str::<NonAuthoritative>("true").is_err());
    }
}
