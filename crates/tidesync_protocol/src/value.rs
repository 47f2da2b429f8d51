//! Dynamic column values and coercion to column types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 2^63, the first float past the `i64` range.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Logical column type understood by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean flag.
    Boolean,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
}

/// A single column or parameter value.
///
/// Driver-native values are mapped to this type at the provider boundary.
/// Before a value is bound to a command parameter it is coerced to the
/// parameter's declared [`DataType`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum SyncValue {
    /// Database null.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
}

impl SyncValue {
    /// Returns true for database null.
    pub fn is_null(&self) -> bool {
        matches!(self, SyncValue::Null)
    }

    /// Returns the natural data type of this value, `None` for null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            SyncValue::Null => None,
            SyncValue::Bool(_) => Some(DataType::Boolean),
            SyncValue::Integer(_) => Some(DataType::Integer),
            SyncValue::Float(_) => Some(DataType::Float),
            SyncValue::Text(_) => Some(DataType::Text),
            SyncValue::Bytes(_) => Some(DataType::Bytes),
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SyncValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SyncValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SyncValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the byte payload, if any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SyncValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Converts this value to the given column type.
    ///
    /// Null stays null for every type. Lossy conversions (a float with a
    /// fractional part to an integer, non-UTF-8 bytes to text) fail.
    pub fn coerce(&self, target: DataType) -> ProtocolResult<SyncValue> {
        let coerced = match (self, target) {
            (SyncValue::Null, _) => Some(SyncValue::Null),

            (SyncValue::Bool(v), DataType::Boolean) => Some(SyncValue::Bool(*v)),
            (SyncValue::Integer(v), DataType::Boolean) => Some(SyncValue::Bool(*v != 0)),
            (SyncValue::Text(v), DataType::Boolean) => {
                match v.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(SyncValue::Bool(true)),
                    "false" | "0" => Some(SyncValue::Bool(false)),
                    _ => None,
                }
            }

            (SyncValue::Integer(v), DataType::Integer) => Some(SyncValue::Integer(*v)),
            (SyncValue::Bool(v), DataType::Integer) => Some(SyncValue::Integer(i64::from(*v))),
            (SyncValue::Float(v), DataType::Integer) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < I64_LIMIT {
                    Some(SyncValue::Integer(*v as i64))
                } else {
                    None
                }
            }
            (SyncValue::Text(v), DataType::Integer) => {
                v.trim().parse::<i64>().ok().map(SyncValue::Integer)
            }

            (SyncValue::Float(v), DataType::Float) => Some(SyncValue::Float(*v)),
            (SyncValue::Integer(v), DataType::Float) => Some(SyncValue::Float(*v as f64)),
            (SyncValue::Text(v), DataType::Float) => {
                v.trim().parse::<f64>().ok().map(SyncValue::Float)
            }

            (SyncValue::Text(v), DataType::Text) => Some(SyncValue::Text(v.clone())),
            (SyncValue::Integer(v), DataType::Text) => Some(SyncValue::Text(v.to_string())),
            (SyncValue::Float(v), DataType::Text) => Some(SyncValue::Text(v.to_string())),
            (SyncValue::Bool(v), DataType::Text) => Some(SyncValue::Text(v.to_string())),
            (SyncValue::Bytes(v), DataType::Text) => {
                String::from_utf8(v.clone()).ok().map(SyncValue::Text)
            }

            (SyncValue::Bytes(v), DataType::Bytes) => Some(SyncValue::Bytes(v.clone())),
            (SyncValue::Text(v), DataType::Bytes) => Some(SyncValue::Bytes(v.as_bytes().to_vec())),

            _ => None,
        };

        coerced.ok_or_else(|| ProtocolError::Coercion {
            value: self.to_string(),
            to: target,
        })
    }

    /// Renders the value as a stable key fragment.
    ///
    /// Used to build primary-key lookups and folder names; two values that
    /// compare equal always render identically.
    pub fn key_fragment(&self) -> String {
        match self {
            SyncValue::Null => "null".to_string(),
            SyncValue::Bool(v) => format!("b:{v}"),
            SyncValue::Integer(v) => format!("i:{v}"),
            SyncValue::Float(v) => format!("f:{v}"),
            SyncValue::Text(v) => format!("t:{v}"),
            SyncValue::Bytes(v) => format!("x:{}", hex::encode(v)),
        }
    }
}

impl fmt::Display for SyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncValue::Null => f.write_str("NULL"),
            SyncValue::Bool(v) => write!(f, "{v}"),
            SyncValue::Integer(v) => write!(f, "{v}"),
            SyncValue::Float(v) => write!(f, "{v}"),
            SyncValue::Text(v) => write!(f, "'{v}'"),
            SyncValue::Bytes(v) => write!(f, "0x{}", hex::encode_upper(v)),
        }
    }
}

impl From<bool> for SyncValue {
    fn from(value: bool) -> Self {
        SyncValue::Bool(value)
    }
}

impl From<i64> for SyncValue {
    fn from(value: i64) -> Self {
        SyncValue::Integer(value)
    }
}

impl From<i32> for SyncValue {
    fn from(value: i32) -> Self {
        SyncValue::Integer(i64::from(value))
    }
}

impl From<f64> for SyncValue {
    fn from(value: f64) -> Self {
        SyncValue::Float(value)
    }
}

impl From<&str> for SyncValue {
    fn from(value: &str) -> Self {
        SyncValue::Text(value.to_string())
    }
}

impl From<String> for SyncValue {
    fn from(value: String) -> Self {
        SyncValue::Text(value)
    }
}

impl From<Vec<u8>> for SyncValue {
    fn from(value: Vec<u8>) -> Self {
        SyncValue::Bytes(value)
    }
}

impl<T: Into<SyncValue>> From<Option<T>> for SyncValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SyncValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_coerces_to_every_type() {
        for ty in [
            DataType::Boolean,
            DataType::Integer,
            DataType::Float,
            DataType::Text,
            DataType::Bytes,
        ] {
            assert_eq!(SyncValue::Null.coerce(ty).unwrap(), SyncValue::Null);
        }
    }

    #[test]
    fn text_to_numbers() {
        assert_eq!(
            SyncValue::from(" 42 ").coerce(DataType::Integer).unwrap(),
            SyncValue::Integer(42)
        );
        assert_eq!(
            SyncValue::from("2.5").coerce(DataType::Float).unwrap(),
            SyncValue::Float(2.5)
        );
        assert!(SyncValue::from("forty").coerce(DataType::Integer).is_err());
    }

    #[test]
    fn integer_to_bool_and_back() {
        assert_eq!(
            SyncValue::Integer(0).coerce(DataType::Boolean).unwrap(),
            SyncValue::Bool(false)
        );
        assert_eq!(
            SyncValue::Bool(true).coerce(DataType::Integer).unwrap(),
            SyncValue::Integer(1)
        );
    }

    #[test]
    fn lossy_float_rejected() {
        assert!(SyncValue::Float(1.5).coerce(DataType::Integer).is_err());
        assert_eq!(
            SyncValue::Float(3.0).coerce(DataType::Integer).unwrap(),
            SyncValue::Integer(3)
        );
        assert!(SyncValue::Float(9_223_372_036_854_775_808.0)
            .coerce(DataType::Integer)
            .is_err());
        assert!(SyncValue::Float(-9_223_372_036_854_775_808.0)
            .coerce(DataType::Integer)
            .is_ok());
    }

    #[test]
    fn bytes_and_text() {
        assert_eq!(
            SyncValue::from("ab").coerce(DataType::Bytes).unwrap(),
            SyncValue::Bytes(vec![b'a', b'b'])
        );
        assert!(SyncValue::Bytes(vec![0xFF, 0xFE])
            .coerce(DataType::Text)
            .is_err());
        assert!(SyncValue::Bytes(vec![1]).coerce(DataType::Integer).is_err());
    }

    #[test]
    fn key_fragments_distinguish_types() {
        assert_ne!(
            SyncValue::Integer(1).key_fragment(),
            SyncValue::from("1").key_fragment()
        );
        assert_eq!(SyncValue::Bytes(vec![0xAB]).key_fragment(), "x:ab");
    }

    #[test]
    fn option_conversion() {
        assert_eq!(SyncValue::from(None::<i64>), SyncValue::Null);
        assert_eq!(SyncValue::from(Some(7i64)), SyncValue::Integer(7));
    }
}
