//! Additive bucket checksums.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A 32-bit additive checksum.
///
/// Addition wraps, which makes the combined checksum of a set of entries
/// independent of the order the entries are visited in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(u32);

impl Checksum {
    /// The empty checksum.
    pub const ZERO: Checksum = Checksum(0);

    /// Creates a checksum from an unsigned value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Creates a checksum from any integer the service may send.
    ///
    /// Values are truncated to their low 32 bits, so `-1` and `4294967295`
    /// are the same checksum.
    #[must_use]
    pub const fn from_wire(value: i64) -> Self {
        Self(value as u32)
    }

    /// Returns the unsigned value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl Add for Checksum {
    type Output = Checksum;

    fn add(self, rhs: Checksum) -> Checksum {
        Checksum(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Checksum {
    fn add_assign(&mut self, rhs: Checksum) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sum for Checksum {
    fn sum<I: Iterator<Item = Checksum>>(iter: I) -> Checksum {
        iter.fold(Checksum::ZERO, |acc, c| acc + c)
    }
}

impl<'a> Sum<&'a Checksum> for Checksum {
    fn sum<I: Iterator<Item = &'a Checksum>>(iter: I) -> Checksum {
        iter.copied().sum()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ChecksumVisitor)
    }
}

struct ChecksumVisitor;

impl<'de> Visitor<'de> for ChecksumVisitor {
    type Value = Checksum;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer checksum")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Checksum, E> {
        Ok(Checksum(v as u32))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Checksum, E> {
        Ok(Checksum::from_wire(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Checksum, E> {
        if v.fract() != 0.0 {
            return Err(E::custom(format!("non-integral checksum {v}")));
        }
        Ok(Checksum::from_wire(v as i64))
    }
}
