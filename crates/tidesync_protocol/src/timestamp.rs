//! Change-tracking timestamps.
//!
//! Stores report the logical time of a change in different shapes: SQLite
//! and PostgreSQL hand back integers, some drivers render the counter as a
//! hexadecimal string, and SQL Server `rowversion` arrives as an 8-byte
//! big-endian array. Every shape is decoded into one canonical [`Timestamp`]
//! so watermarks compare correctly.

use crate::value::SyncValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical 64-bit logical timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp (no change recorded).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from its canonical value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the canonical value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next timestamp.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Encodes the timestamp in the given driver shape. Integer drivers are
    /// signed, so values past `i64::MAX` overflow.
    pub fn encode(self, encoding: TimestampEncoding) -> Result<SyncValue, TimestampError> {
        Ok(match encoding {
            TimestampEncoding::Integer => {
                SyncValue::Integer(i64::try_from(self.0).map_err(|_| TimestampError::Overflow)?)
            }
            TimestampEncoding::HexString => SyncValue::Text(format!("{:X}", self.0)),
            TimestampEncoding::Bytes => SyncValue::Bytes(self.0.to_be_bytes().to_vec()),
        })
    }

    /// Decodes a raw timestamp.
    ///
    /// Null decodes to [`Timestamp::ZERO`]. Malformed input is an error and is
    /// never folded into zero.
    pub fn parse(raw: &RawTimestamp) -> Result<Timestamp, TimestampError> {
        match raw {
            RawTimestamp::Null => Ok(Timestamp::ZERO),
            RawTimestamp::Integer(v) => u64::try_from(*v).map(Timestamp).map_err(|_| {
                if *v < 0 {
                    TimestampError::Negative(*v)
                } else {
                    TimestampError::Overflow
                }
            }),
            RawTimestamp::HexString(s) => parse_hex(s),
            RawTimestamp::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(TimestampError::Empty);
                }
                let rendered: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
                parse_hex(&rendered)
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

fn parse_hex(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(TimestampError::Empty);
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TimestampError::InvalidHex(input.to_string()));
    }

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(Timestamp::ZERO);
    }
    if significant.len() > 16 {
        return Err(TimestampError::Overflow);
    }

    u64::from_str_radix(significant, 16)
        .map(Timestamp)
        .map_err(|_| TimestampError::InvalidHex(input.to_string()))
}

/// A timestamp exactly as the store returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTimestamp {
    /// Database null: no change recorded.
    Null,
    /// Any native integer type.
    Integer(i128),
    /// Hexadecimal rendering of the counter.
    HexString(String),
    /// Big-endian counter bytes.
    Bytes(Vec<u8>),
}

impl From<i64> for RawTimestamp {
    fn from(value: i64) -> Self {
        RawTimestamp::Integer(i128::from(value))
    }
}

impl From<u64> for RawTimestamp {
    fn from(value: u64) -> Self {
        RawTimestamp::Integer(i128::from(value))
    }
}

impl From<i32> for RawTimestamp {
    fn from(value: i32) -> Self {
        RawTimestamp::Integer(i128::from(value))
    }
}

impl From<&str> for RawTimestamp {
    fn from(value: &str) -> Self {
        RawTimestamp::HexString(value.to_string())
    }
}

impl From<Vec<u8>> for RawTimestamp {
    fn from(value: Vec<u8>) -> Self {
        RawTimestamp::Bytes(value)
    }
}

impl TryFrom<&SyncValue> for RawTimestamp {
    type Error = TimestampError;

    fn try_from(value: &SyncValue) -> Result<Self, Self::Error> {
        match value {
            SyncValue::Null => Ok(RawTimestamp::Null),
            SyncValue::Integer(v) => Ok(RawTimestamp::from(*v)),
            SyncValue::Text(v) => Ok(RawTimestamp::HexString(v.clone())),
            SyncValue::Bytes(v) => Ok(RawTimestamp::Bytes(v.clone())),
            SyncValue::Bool(_) => Err(TimestampError::Unsupported("boolean")),
            SyncValue::Float(_) => Err(TimestampError::Unsupported("float")),
        }
    }
}

/// Shape in which a store reports timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampEncoding {
    /// Native integer.
    #[default]
    Integer,
    /// Hexadecimal string.
    HexString,
    /// 8-byte big-endian array.
    Bytes,
}

/// Errors decoding a raw timestamp.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// Empty string or byte array.
    #[error("timestamp is empty")]
    Empty,

    /// String contains non-hexadecimal characters.
    #[error("timestamp is not valid hexadecimal: {0:?}")]
    InvalidHex(String),

    /// Integer timestamps cannot be negative.
    #[error("timestamp is negative: {0}")]
    Negative(i128),

    /// Value does not fit in 64 bits.
    #[error("timestamp does not fit in 64 bits")]
    Overflow,

    /// The store returned a value type that cannot carry a timestamp.
    #[error("unsupported timestamp value type: {0}")]
    Unsupported(&'static str),
}
