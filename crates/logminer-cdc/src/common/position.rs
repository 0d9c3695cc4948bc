//! Log positions
//!
//! A [`PositionToken`] is the logical clock of a transaction log: an Oracle
//! SCN or a PostgreSQL LSN. Besides concrete values it carries two sentinels:
//!
//! - `Null`: unknown or unset (no checkpoint yet, empty catalog column)
//! - `Max`: end-of-log placeholder (the open tail of the current segment)
//!
//! Ordering is total: `Null < Value(_) < Max`. Arithmetic saturates and
//! treats `Null` as the identity, so a missing bound never poisons a window
//! computation.
//!
//! Tokens carry no backend identity. Comparing tokens produced by different
//! sources is meaningless and is never done by the mining loop.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Position in a transaction log (SCN or LSN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PositionToken {
    /// Unknown/unset position
    #[default]
    Null,
    /// Concrete log position
    Value(i128),
    /// End-of-log placeholder
    Max,
}

impl PositionToken {
    /// Concrete position from an unsigned value.
    pub fn new(value: u64) -> Self {
        Self::Value(i128::from(value))
    }

    /// Whether this is the `Null` sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this is the `Max` sentinel.
    pub fn is_max(&self) -> bool {
        matches!(self, Self::Max)
    }

    /// Concrete value, if any.
    pub fn value(&self) -> Option<i128> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// Concrete value as `i64` for driver binds. `None` for sentinels and
    /// values outside the `i64` range.
    pub fn to_i64(&self) -> Option<i64> {
        self.value().and_then(|v| i64::try_from(v).ok())
    }

    /// Parse a decimal position. Only ASCII digits are accepted.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CdcError::malformed_position(format!(
                "expected a decimal position, got '{}'",
                s
            )));
        }
        trimmed
            .parse::<i128>()
            .map(Self::Value)
            .map_err(|e| CdcError::malformed_position(format!("'{}': {}", s, e)))
    }

    /// Parse the text form written by [`Display`](fmt::Display), including the
    /// `null` and `max` sentinels.
    pub fn parse_stored(s: &str) -> Result<Self> {
        match s.trim() {
            "null" => Ok(Self::Null),
            "max" => Ok(Self::Max),
            other => Self::parse(other),
        }
    }

    /// Parse a PostgreSQL LSN in `XXX/YYY` hex notation.
    pub fn from_pg_lsn(lsn: &str) -> Result<Self> {
        let (high, low) = lsn
            .trim()
            .split_once('/')
            .ok_or_else(|| CdcError::malformed_position(format!("invalid LSN '{}'", lsn)))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|e| CdcError::malformed_position(format!("invalid LSN '{}': {}", lsn, e)))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|e| CdcError::malformed_position(format!("invalid LSN '{}': {}", lsn, e)))?;
        Ok(Self::new((u64::from(high) << 32) | u64::from(low)))
    }

    /// Format as a PostgreSQL LSN. `None` for sentinels and values that do
    /// not fit 64 bits.
    pub fn to_pg_lsn(&self) -> Option<String> {
        let v = self.value().and_then(|v| u64::try_from(v).ok())?;
        Some(format!("{:X}/{:X}", v >> 32, v & 0xFFFF_FFFF))
    }

    /// The smaller of two positions.
    pub fn min_of(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }
}

impl Add for PositionToken {
    type Output = PositionToken;

    fn add(self, rhs: Self) -> Self::Output {
        use PositionToken::*;
        match (self, rhs) {
            (Null, other) | (other, Null) => other,
            (Max, _) | (_, Max) => Max,
            (Value(a), Value(b)) => Value(a.saturating_add(b)),
        }
    }
}

impl Sub for PositionToken {
    type Output = PositionToken;

    fn sub(self, rhs: Self) -> Self::Output {
        use PositionToken::*;
        match (self, rhs) {
            (lhs, Null) => lhs,
            (Null, Value(b)) => Value(b.saturating_neg()),
            (Null, Max) | (Value(_), Max) => Value(i128::MIN),
            (Max, Max) => Null,
            (Max, Value(_)) => Max,
            (Value(a), Value(b)) => Value(a.saturating_sub(b)),
        }
    }
}

impl From<u64> for PositionToken {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl FromStr for PositionToken {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Value(v) => write!(f, "{}", v),
            Self::Max => f.write_str("max"),
        }
    }
}

impl Serialize for PositionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PositionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_stored(&s).map_err(serde::de::Error::custom)
    }
}
