//! Operation identifiers.

use crate::error::ProtocolError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An op id that is larger than any id the service will ever assign.
///
/// Used as the `$local` bucket target while local writes are unacknowledged.
pub const MAX_OP_ID: OpId = OpId(i64::MAX as u64);

/// A per-bucket monotonic operation identifier.
///
/// Op ids are only meaningfully ordered within one bucket. Across buckets the
/// only rule is "larger wins" for the same logical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId(u64);

impl OpId {
    /// The zero op id, used for buckets that have not received data.
    pub const ZERO: OpId = OpId(0);

    /// Creates an op id from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is [`MAX_OP_ID`].
    #[must_use]
    pub fn is_max(self) -> bool {
        self == MAX_OP_ID
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OpId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(OpId)
            .map_err(|_| ProtocolError::InvalidOpId(s.to_string()))
    }
}

impl Serialize for OpId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OpIdVisitor)
    }
}

struct OpIdVisitor;

impl<'de> Visitor<'de> for OpIdVisitor {
    type Value = OpId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative op id as a string or integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<OpId, E> {
        Ok(OpId(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<OpId, E> {
        u64::try_from(v)
            .map(OpId)
            .map_err(|_| E::custom(format!("negative op id {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<OpId, E> {
        v.parse().map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_strings() {
        assert_eq!("42".parse::<OpId>().unwrap(), OpId::new(42));
        assert_eq!(
            "9223372036854775807".parse::<OpId>().unwrap(),
            MAX_OP_ID
        );
        assert!("abc".parse::<OpId>().is_err());
        assert!("-1".parse::<OpId>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&OpId::new(7)).unwrap();
        assert_eq!(json, "\"7\"");
    }

    #[test]
    fn deserializes_strings_and_numbers() {
        let a: OpId = serde_json::from_str("\"15\"").unwrap();
        let b: OpId = serde_json::from_str("15").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<OpId>("-4").is_err());
    }

    #[test]
    fn max_is_i64_max() {
        assert_eq!(MAX_OP_ID.as_u64(), i64::MAX as u64);
        assert!(MAX_OP_ID.is_max());
        assert!(OpId::new(3) < MAX_OP_ID);
    }
}
