//! Sample components and registry setup shared by unit tests, integration
//! tests and benches.

use crate::component::{ComponentTypeRegistry, NetComponent, TypedComponent};
use crate::delta::ChangeContext;
use crate::error::Result;
use crate::protocol::{FieldMap, FieldReader, FieldType, FieldValue};
use crate::reflective::{ReflectiveRegistry, SyncVar, ValueKind};
use crate::schema::{FieldOptions, SchemaRegistry, SyncPriority};

/// Schema-backed, with a change hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl NetComponent for Position {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("x".to_string(), FieldValue::F32(self.x));
        fields.insert("y".to_string(), FieldValue::F32(self.y));
        fields.insert("z".to_string(), FieldValue::F32(self.z));
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let reader = FieldReader::new(Self::TYPE_NAME, fields);
        let (x, y, z) = (reader.f32("x")?, reader.f32("y")?, reader.f32("z")?);
        *self = Self { x, y, z };
        Ok(())
    }

    fn has_changed(&self, context: &ChangeContext<'_>) -> Option<bool> {
        Some(context.differs(&self.to_fields()))
    }
}

impl TypedComponent for Position {
    const TYPE_NAME: &'static str = "Position";
}

/// Schema-backed, with a change hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Health {
    pub current: i32,
    pub max: i32,
}

impl Health {
    pub fn new(current: i32, max: i32) -> Self {
        Self { current, max }
    }
}

impl NetComponent for Health {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("current".to_string(), FieldValue::I32(self.current));
        fields.insert("max".to_string(), FieldValue::I32(self.max));
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let reader = FieldReader::new(Self::TYPE_NAME, fields);
        let (current, max) = (reader.i32("current")?, reader.i32("max")?);
        *self = Self { current, max };
        Ok(())
    }

    fn has_changed(&self, context: &ChangeContext<'_>) -> Option<bool> {
        Some(context.differs(&self.to_fields()))
    }
}

impl TypedComponent for Health {
    const TYPE_NAME: &'static str = "Health";
}

/// Reflective only: declared through sync vars, no schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub items: Vec<String>,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

impl Inventory {
    pub fn new(items: Vec<String>, updated_at: i64) -> Self {
        Self { items, updated_at }
    }
}

impl NetComponent for Inventory {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "items".to_string(),
            FieldValue::Repeated(self.items.iter().map(|item| item.as_str().into()).collect()),
        );
        fields.insert("updatedAt".to_string(), FieldValue::Timestamp(self.updated_at));
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let reader = FieldReader::new(Self::TYPE_NAME, fields);
        let items = reader
            .repeated("items")?
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| crate::error::SyncError::FieldType {
                        component: Self::TYPE_NAME.to_string(),
                        field: "items".to_string(),
                        expected: "string",
                    })
            })
            .collect::<Result<Vec<String>>>()?;
        let updated_at = reader.timestamp("updatedAt")?;

        *self = Self { items, updated_at };
        Ok(())
    }

    fn has_changed(&self, context: &ChangeContext<'_>) -> Option<bool> {
        Some(context.differs(&self.to_fields()))
    }
}

impl TypedComponent for Inventory {
    const TYPE_NAME: &'static str = "Inventory";
}

/// Neither schema nor sync vars, and no change hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Marker {
    pub label: String,
}

impl Marker {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl NetComponent for Marker {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("label".to_string(), self.label.as_str().into());
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        self.label = FieldReader::new(Self::TYPE_NAME, fields).string("label")?;
        Ok(())
    }
}

impl TypedComponent for Marker {
    const TYPE_NAME: &'static str = "Marker";
}

/// Narrow numeric fields with a change hook. Left unregistered so tests can
/// pick the codec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Velocity {
    pub dx: f32,
    pub hp: i32,
}

impl Velocity {
    pub fn new(dx: f32, hp: i32) -> Self {
        Self { dx, hp }
    }
}

impl NetComponent for Velocity {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("dx".to_string(), FieldValue::F32(self.dx));
        fields.insert("hp".to_string(), FieldValue::I32(self.hp));
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let reader = FieldReader::new(Self::TYPE_NAME, fields);
        let (dx, hp) = (reader.f32("dx")?, reader.i32("hp")?);
        *self = Self { dx, hp };
        Ok(())
    }

    fn has_changed(&self, context: &ChangeContext<'_>) -> Option<bool> {
        Some(context.differs(&self.to_fields()))
    }
}

impl TypedComponent for Velocity {
    const TYPE_NAME: &'static str = "Velocity";
}

/// Only ever encoded untyped: bytes, timestamps and enums with no metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blob {
    pub payload: Vec<u8>,
    /// Epoch milliseconds.
    pub seen_at: i64,
    pub mode: i32,
}

impl NetComponent for Blob {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("payload".to_string(), FieldValue::Bytes(self.payload.clone()));
        fields.insert("seenAt".to_string(), FieldValue::Timestamp(self.seen_at));
        fields.insert("mode".to_string(), FieldValue::Enum(self.mode));
        fields
    }

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let reader = FieldReader::new(Self::TYPE_NAME, fields);
        let payload = reader.bytes("payload")?;
        let seen_at = reader.timestamp("seenAt")?;
        let mode = match reader.get("mode")? {
            FieldValue::Enum(mode) => *mode,
            _ => {
                return Err(crate::error::SyncError::FieldType {
                    component: Self::TYPE_NAME.to_string(),
                    field: "mode".to_string(),
                    expected: "enum",
                })
            }
        };

        *self = Self { payload, seen_at, mode };
        Ok(())
    }

    fn has_changed(&self, context: &ChangeContext<'_>) -> Option<bool> {
        Some(context.differs(&self.to_fields()))
    }
}

impl TypedComponent for Blob {
    const TYPE_NAME: &'static str = "Blob";
}

pub fn register_schemas(registry: &SchemaRegistry) -> Result<()> {
    registry
        .component(Position::TYPE_NAME)
        .field_with(1, "x", FieldType::Float, FieldOptions::new().with_interpolation())?
        .field_with(2, "y", FieldType::Float, FieldOptions::new().with_interpolation())?
        .field_with(3, "z", FieldType::Float, FieldOptions::new().with_interpolation())?
        .register()?;

    registry
        .component(Health::TYPE_NAME)
        .field_with(1, "current", FieldType::Int32, FieldOptions::new().with_priority(SyncPriority::High))?
        .field(2, "max", FieldType::Int32)?
        .register()?;

    Ok(())
}

pub fn register_sync_vars(registry: &ReflectiveRegistry) -> Result<()> {
    registry.register(
        Inventory::TYPE_NAME,
        vec![
            SyncVar::new("items", ValueKind::Array(Box::new(ValueKind::String))),
            SyncVar::new("updatedAt", ValueKind::Date).with_priority(SyncPriority::Low),
        ],
    )
}

pub fn register_types(registry: &ComponentTypeRegistry) -> Result<()> {
    registry.register_type::<Position>()?;
    registry.register_type::<Health>()?;
    registry.register_type::<Inventory>()?;
    registry.register_type::<Marker>()?;
    registry.register_type::<Velocity>()?;
    registry.register_type::<Blob>()?;
    Ok(())
}

/// Fresh, fully populated registries.
pub fn registries() -> Result<(SchemaRegistry, ReflectiveRegistry, ComponentTypeRegistry)> {
    let schemas = SchemaRegistry::new();
    let sync_vars = ReflectiveRegistry::new();
    let types = ComponentTypeRegistry::new();

    register_schemas(&schemas)?;
    register_sync_vars(&sync_vars)?;
    register_types(&types)?;

    Ok((schemas, sync_vars, types))
}
