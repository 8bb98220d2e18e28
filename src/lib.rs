pub mod protocol;
pub mod error;
pub mod schema;
pub mod idl;
pub mod wire;
pub mod schema_codec;
pub mod reflective;
pub mod component;
pub mod entity;
pub mod delta;
pub mod snapshot;
pub mod sync;
pub mod serialization;
pub mod debug;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use protocol::{
    EntityId, ComponentId, FieldNumber,
    FieldMap, FieldValue, FieldType, FieldReader,
    CodecKind, SerializedData,
};

pub use error::{
    SyncError, Result,
};

pub use schema::{
    ComponentSchema, ComponentOptions, ComponentBuilder,
    FieldDescriptor, FieldOptions,
    SchemaRegistry, SchemaVersion, SyncMode, SyncPriority,
};

pub use idl::{
    CompiledIdl, CompiledMessage, CompiledField,
};

pub use schema_codec::{
    SchemaCodec, SchemaCodecConfig, SchemaCodecStats,
    BatchOptions, BatchResult, BatchError,
};

pub use reflective::{
    ReflectiveCodec, ReflectiveRegistry, ReflectiveStats,
    SyncVar, ValueKind,
};

pub use component::{
    NetComponent, TypedComponent, ComponentTypeRegistry, ComponentConstructor,
};

pub use entity::{
    Entity, ComponentSlot,
};

pub use delta::{
    ChangeContext, has_entity_structure_changed,
};

pub use snapshot::{
    SceneSnapshot, EntitySnapshot, ComponentSnapshot,
    ComponentSnapshotConfig, SnapshotKind,
};

pub use sync::{
    SnapshotManager, SnapshotConfig, SnapshotCache,
};

pub use serialization::{
    BinarySerializer, BinaryFormat,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_snapshot, trace_snapshot,
    trace_serialization, trace_deserialization,
    format_bytes, snapshot_summary,
};
