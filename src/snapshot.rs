use crate::protocol::{ComponentId, EntityId, SerializedData};
use crate::schema::SyncPriority;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Full,
    Incremental,
}

/// Per-component snapshot policy, recorded alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSnapshotConfig {
    pub include_in_snapshot: bool,
    pub compression_level: u8,
    pub sync_priority: SyncPriority,
    /// When false the component is re-sent in every incremental snapshot.
    pub enable_incremental: bool,
}

impl Default for ComponentSnapshotConfig {
    fn default() -> Self {
        Self {
            include_in_snapshot: true,
            compression_level: 0,
            sync_priority: SyncPriority::Medium,
            enable_incremental: true,
        }
    }
}

impl ComponentSnapshotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn excluded() -> Self {
        Self {
            include_in_snapshot: false,
            ..Self::default()
        }
    }

    pub fn with_compression_level(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_priority(mut self, priority: SyncPriority) -> Self {
        self.sync_priority = priority;
        self
    }

    pub fn with_incremental(mut self, enabled: bool) -> Self {
        self.enable_incremental = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    #[serde(rename = "type")]
    pub component_type: String,
    pub id: ComponentId,
    pub data: SerializedData,
    pub enabled: bool,
    pub config: ComponentSnapshotConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub enabled: bool,
    pub active: bool,
    pub tag: u32,
    pub update_order: i32,
    pub components: Vec<ComponentSnapshot>,
    pub children: Vec<EntityId>,
    pub parent: Option<EntityId>,
    pub timestamp: u64,
}

impl EntitySnapshot {
    pub fn component(&self, component_type: &str) -> Option<&ComponentSnapshot> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }

    /// Recorded component types, sorted.
    pub fn component_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .components
            .iter()
            .map(|c| c.component_type.as_str())
            .collect();
        types.sort_unstable();
        types
    }
}

/// A full or incremental capture of a set of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub entities: Vec<EntitySnapshot>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: SnapshotKind,
    pub base_snapshot_id: Option<String>,
    /// Entities present in the base but gone or destroyed since.
    #[serde(default)]
    pub removed_entities: Vec<EntityId>,
}

impl SceneSnapshot {
    pub fn snapshot_id(&self) -> String {
        format!("snapshot_{}_{}", self.timestamp, self.entities.len())
    }

    pub fn is_incremental(&self) -> bool {
        self.kind == SnapshotKind::Incremental
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn is_based_on(&self, base: &SceneSnapshot) -> bool {
        self.base_snapshot_id.as_deref() == Some(base.snapshot_id().as_str())
    }

    pub fn component_count(&self) -> usize {
        self.entities.iter().map(|e| e.components.len()).sum()
    }

    /// Total encoded payload bytes across all components.
    pub fn payload_size(&self) -> usize {
        self.entities
            .iter()
            .flat_map(|e| e.components.iter())
            .map(|c| c.data.size)
            .sum()
    }
}

/// Current wall clock in epoch milliseconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
