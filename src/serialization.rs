use crate::debug::{trace_deserialization, trace_serialization};
use crate::error::Result;
use crate::protocol::SerializedData;
use crate::snapshot::SceneSnapshot;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Instant;

/// Outer encoding for snapshots handed to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Json,
    MessagePack,
    Bincode,
}

impl BinaryFormat {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryFormat::Json => "json",
            BinaryFormat::MessagePack => "messagepack",
            BinaryFormat::Bincode => "bincode",
        }
    }
}

pub struct BinarySerializer {
    format: BinaryFormat,
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn get_format(&self) -> BinaryFormat {
        self.format
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let data = match self.format {
            BinaryFormat::Json => serde_json::to_vec(value)?,
            BinaryFormat::MessagePack => rmp_serde::to_vec(value)?,
            BinaryFormat::Bincode => bincode::serialize(value)?,
        };
        Ok(Bytes::from(data))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let value = match self.format {
            BinaryFormat::Json => serde_json::from_slice(data)?,
            BinaryFormat::MessagePack => rmp_serde::from_slice(data)?,
            BinaryFormat::Bincode => bincode::deserialize(data)?,
        };
        Ok(value)
    }

    pub fn serialize_snapshot(&self, snapshot: &SceneSnapshot) -> Result<Bytes> {
        let start = Instant::now();
        let bytes = self.encode(snapshot)?;
        trace_serialization(
            self.format.name(),
            &snapshot.snapshot_id(),
            bytes.len(),
            start.elapsed().as_micros(),
        );
        Ok(bytes)
    }

    pub fn deserialize_snapshot(&self, data: &[u8]) -> Result<SceneSnapshot> {
        let start = Instant::now();
        let snapshot: SceneSnapshot = self.decode(data)?;
        trace_deserialization(
            self.format.name(),
            &snapshot.snapshot_id(),
            data.len(),
            start.elapsed().as_micros(),
        );
        Ok(snapshot)
    }

    pub fn serialize_data(&self, data: &SerializedData) -> Result<Bytes> {
        self.encode(data)
    }

    pub fn deserialize_data(&self, data: &[u8]) -> Result<SerializedData> {
        self.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecKind;
    use crate::snapshot::{ComponentSnapshot, ComponentSnapshotConfig, EntitySnapshot, SnapshotKind};

    fn snapshot() -> SceneSnapshot {
        SceneSnapshot {
            entities: vec![EntitySnapshot {
                id: 1,
                name: "player".to_string(),
                enabled: true,
                active: true,
                tag: 2,
                update_order: -1,
                components: vec![ComponentSnapshot {
                    component_type: "Position".to_string(),
                    id: 1,
                    data: SerializedData::schema("Position", vec![13, 0, 0, 128, 63], "ecs.Position".to_string(), 1),
                    enabled: true,
                    config: ComponentSnapshotConfig::default(),
                }],
                children: vec![2, 3],
                parent: None,
                timestamp: 123,
            }],
            timestamp: 123,
            version: 1,
            kind: SnapshotKind::Incremental,
            base_snapshot_id: Some("snapshot_100_1".to_string()),
            removed_entities: vec![4],
        }
    }

    #[test]
    fn test_snapshot_all_formats() {
        let original = snapshot();

        for serializer in [
            BinarySerializer::json(),
            BinarySerializer::messagepack(),
            BinarySerializer::bincode(),
        ] {
            let bytes = serializer.serialize_snapshot(&original).unwrap();
            let decoded = serializer.deserialize_snapshot(&bytes).unwrap();
            assert_eq!(decoded, original, "format {:?}", serializer.get_format());
        }
    }

    #[test]
    fn test_serialized_data_messagepack() {
        let data = SerializedData::reflective("Marker", br#"{"componentType":"Marker","fields":{}}"#.to_vec());

        let serializer = BinarySerializer::messagepack();
        let bytes = serializer.serialize_data(&data).unwrap();
        let decoded = serializer.deserialize_data(&bytes).unwrap();

        assert_eq!(decoded.kind, CodecKind::Reflective);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_rejects_garbage() {
        let serializer = BinarySerializer::json();
        assert!(serializer.deserialize_snapshot(b"not a snapshot").is_err());
    }
}
