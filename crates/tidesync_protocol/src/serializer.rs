//! Pluggable payload serializers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serializer used for HTTP payloads and batch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerializerKind {
    /// JSON via `serde_json`.
    #[default]
    Json,
    /// CBOR via `ciborium`.
    Cbor,
}

impl SerializerKind {
    /// Name carried in the serializer header.
    pub fn name(&self) -> &'static str {
        match self {
            SerializerKind::Json => "json",
            SerializerKind::Cbor => "cbor",
        }
    }

    /// Resolves a serializer from its header name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(SerializerKind::Json),
            "cbor" => Some(SerializerKind::Cbor),
            _ => None,
        }
    }

    /// Encodes a value.
    pub fn serialize<T: Serialize>(&self, value: &T) -> ProtocolResult<Vec<u8>> {
        match self {
            SerializerKind::Json => serde_json::to_vec(value).map_err(ProtocolError::serialization),
            SerializerKind::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)
                    .map_err(ProtocolError::serialization)?;
                Ok(buf)
            }
        }
    }

    /// Decodes a value.
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> ProtocolResult<T> {
        match self {
            SerializerKind::Json => {
                serde_json::from_slice(bytes).map_err(ProtocolError::serialization)
            }
            SerializerKind::Cbor => {
                ciborium::de::from_reader(bytes).map_err(ProtocolError::serialization)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPart;
    use crate::row::SyncRow;
    use crate::schema::{SyncColumn, SyncTable};
    use crate::timestamp::Timestamp;
    use crate::value::{DataType, SyncValue};

    fn part() -> BatchPart {
        let table = SyncTable::new("Blob")
            .with_column(SyncColumn::new("id", DataType::Integer))
            .with_column(SyncColumn::new("data", DataType::Bytes).nullable())
            .with_column(SyncColumn::new("ratio", DataType::Float))
            .with_primary_key("id");
        BatchPart::new(
            0,
            table,
            vec![
                SyncRow::modified(vec![1.into(), vec![0u8, 255].into(), 0.5.into()])
                    .with_timestamp(Timestamp::new(u64::MAX)),
                SyncRow::deleted(vec![2.into(), SyncValue::Null, 0.0.into()]),
            ],
        )
    }

    #[test]
    fn both_serializers_preserve_parts() {
        for kind in [SerializerKind::Json, SerializerKind::Cbor] {
            let bytes = kind.serialize(&part()).unwrap();
            let decoded: BatchPart = kind.deserialize(&bytes).unwrap();
            assert_eq!(decoded, part(), "{}", kind.name());
        }
    }

    #[test]
    fn names() {
        assert_eq!(SerializerKind::from_name("CBOR"), Some(SerializerKind::Cbor));
        assert_eq!(SerializerKind::from_name(" json "), Some(SerializerKind::Json));
        assert_eq!(SerializerKind::from_name("xml"), None);
    }

    #[test]
    fn garbage_is_an_error() {
        let result: ProtocolResult<BatchPart> = SerializerKind::Json.deserialize(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
        let result: ProtocolResult<BatchPart> = SerializerKind::Cbor.deserialize(&[0xff, 0x00]);
        assert!(result.is_err());
    }
}
