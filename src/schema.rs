use crate::error::{Result, SyncError};
use crate::protocol::{FieldMap, FieldNumber, FieldType, FieldValue, STRUCT_TYPE_NAME};
use ahash::AHashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

pub type SchemaVersion = u32;

/// Largest field number the wire tag can carry.
pub const MAX_FIELD_NUMBER: FieldNumber = (1 << 29) - 1;

/// Package name used in the generated IDL.
pub const IDL_PACKAGE: &str = "ecs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for SyncPriority {
    fn default() -> Self {
        SyncPriority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Delta,
    Adaptive,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Full
    }
}

/// Per-field registration options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    pub repeated: bool,
    pub optional: bool,
    pub sync_priority: SyncPriority,
    pub precision: Option<f64>,
    pub interpolation: bool,
    pub change_threshold: Option<f64>,
    /// Referenced message type for `FieldType::Message` fields.
    pub type_name: Option<String>,
}

impl FieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_priority(mut self, priority: SyncPriority) -> Self {
        self.sync_priority = priority;
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_interpolation(mut self) -> Self {
        self.interpolation = true;
        self
    }

    pub fn with_change_threshold(mut self, threshold: f64) -> Self {
        self.change_threshold = Some(threshold);
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

/// One synchronizable field of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub number: FieldNumber,
    pub name: String,
    pub field_type: FieldType,
    pub repeated: bool,
    pub optional: bool,
    pub sync_priority: SyncPriority,
    pub precision: Option<f64>,
    pub interpolation: bool,
    pub change_threshold: Option<f64>,
    pub type_name: Option<String>,
}

impl FieldDescriptor {
    pub fn new(number: FieldNumber, name: impl Into<String>, field_type: FieldType) -> Self {
        Self::with_options(number, name, field_type, FieldOptions::default())
    }

    pub fn with_options(
        number: FieldNumber,
        name: impl Into<String>,
        field_type: FieldType,
        options: FieldOptions,
    ) -> Self {
        Self {
            number,
            name: name.into(),
            field_type,
            repeated: options.repeated,
            optional: options.optional,
            sync_priority: options.sync_priority,
            precision: options.precision.filter(|p| *p > 0.0),
            interpolation: options.interpolation,
            change_threshold: options.change_threshold,
            type_name: options.type_name,
        }
    }

    /// Whether `current` differs from `base` by more than this field's
    /// change threshold.
    ///
    /// `base` is usually a decoded payload, so fields with a precision compare
    /// by quantisation step and everything else ignores numeric width.
    pub fn exceeds_threshold(&self, current: &FieldValue, base: &FieldValue) -> bool {
        if let (FieldValue::Repeated(current), FieldValue::Repeated(base)) = (current, base) {
            return current.len() != base.len()
                || current.iter().zip(base).any(|(c, b)| self.exceeds_threshold(c, b));
        }

        if self.field_type.is_numeric() {
            if let (Some(a), Some(b)) = (current.as_f64(), base.as_f64()) {
                if let Some(threshold) = self.change_threshold {
                    return (a - b).abs() > threshold;
                }
                if let (Some(step), FieldType::Float | FieldType::Double) = (self.precision, self.field_type) {
                    return (a / step).round() != (b / step).round();
                }
            }
        }

        !current.same_value(base)
    }
}

/// Per-component registration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentOptions {
    pub version: SchemaVersion,
    pub sync_mode: SyncMode,
    /// Updates per second.
    pub sync_frequency: u32,
    pub compression: bool,
    pub network_priority: u8,
    /// Validate values against the schema before encoding, if the codec allows.
    pub validate: bool,
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            version: 1,
            sync_mode: SyncMode::Full,
            sync_frequency: 20,
            compression: false,
            network_priority: 5,
            validate: true,
        }
    }
}

impl ComponentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: SchemaVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_sync_frequency(mut self, frequency: u32) -> Self {
        self.sync_frequency = frequency;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_network_priority(mut self, priority: u8) -> Self {
        self.network_priority = priority;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSchema {
    pub name: String,
    /// Declaration order.
    pub fields: Vec<FieldDescriptor>,
    pub options: ComponentOptions,
}

impl ComponentSchema {
    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_field_by_number(&self, number: FieldNumber) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn fields_by_number(&self) -> Vec<&FieldDescriptor> {
        let mut fields: Vec<&FieldDescriptor> = self.fields.iter().collect();
        fields.sort_by_key(|f| f.number);
        fields
    }

    pub fn version(&self) -> SchemaVersion {
        self.options.version
    }

    /// Field names whose values moved beyond their change threshold.
    pub fn changed_fields(&self, current: &FieldMap, base: &FieldMap) -> Vec<String> {
        self.fields
            .iter()
            .filter(|field| match (current.get(&field.name), base.get(&field.name)) {
                (Some(c), Some(b)) => field.exceeds_threshold(c, b),
                (None, None) => false,
                _ => true,
            })
            .map(|field| field.name.clone())
            .collect()
    }
}

#[derive(Default)]
struct RegistryState {
    pending: AHashMap<String, Vec<FieldDescriptor>>,
    schemas: AHashMap<String, Arc<ComponentSchema>>,
    sealed: bool,
    revision: u64,
}

impl RegistryState {
    fn check_open(&self, component: &str) -> Result<()> {
        if self.sealed {
            return Err(SyncError::RegistrySealed(component.to_string()));
        }
        Ok(())
    }
}

static GLOBAL_REGISTRY: Lazy<SchemaRegistry> = Lazy::new(SchemaRegistry::new);

/// Field-numbered component schemas, looked up by component name.
///
/// Cloning shares the underlying state, so a registry can be handed to
/// several codecs and still be populated in one place.
pub struct SchemaRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// Process-wide default instance for call sites without an injected registry.
    pub fn global() -> SchemaRegistry {
        GLOBAL_REGISTRY.clone()
    }

    pub fn component(&self, name: impl Into<String>) -> ComponentBuilder<'_> {
        ComponentBuilder {
            registry: self,
            name: name.into(),
            options: ComponentOptions::default(),
        }
    }

    pub fn register_field(
        &self,
        component: &str,
        number: FieldNumber,
        name: &str,
        field_type: FieldType,
        options: FieldOptions,
    ) -> Result<()> {
        if component.is_empty() || name.is_empty() {
            return Err(SyncError::MissingTypeName);
        }

        if number == 0 || number > MAX_FIELD_NUMBER {
            return Err(SyncError::InvalidFieldNumber {
                component: component.to_string(),
                field: name.to_string(),
                number,
                max: MAX_FIELD_NUMBER,
            });
        }

        let mut state = self.state.write().map_err(SyncError::poisoned)?;
        state.check_open(component)?;

        let fields = state.pending.entry(component.to_string()).or_default();

        if let Some(existing) = fields.iter().find(|f| f.number == number && f.name != name) {
            return Err(SyncError::FieldNumberCollision {
                component: component.to_string(),
                number,
                existing: existing.name.clone(),
                field: name.to_string(),
            });
        }

        if let Some(existing) = fields.iter().find(|f| f.name == name && f.number != number) {
            return Err(SyncError::DuplicateFieldName {
                component: component.to_string(),
                field: name.to_string(),
                existing: existing.number,
                number,
            });
        }

        let descriptor = FieldDescriptor::with_options(number, name, field_type, options);
        match fields.iter_mut().find(|f| f.number == number) {
            Some(slot) => *slot = descriptor,
            None => fields.push(descriptor),
        }

        Ok(())
    }

    /// Publishes the fields collected so far for `component`.
    pub fn register_component(&self, component: &str, options: ComponentOptions) -> Result<Arc<ComponentSchema>> {
        if component.is_empty() {
            return Err(SyncError::MissingTypeName);
        }

        let mut state = self.state.write().map_err(SyncError::poisoned)?;
        state.check_open(component)?;

        let fields = state.pending.get(component).cloned().unwrap_or_default();
        let schema = Arc::new(ComponentSchema {
            name: component.to_string(),
            fields,
            options,
        });

        state.schemas.insert(component.to_string(), Arc::clone(&schema));
        state.revision += 1;

        Ok(schema)
    }

    /// `None` for unknown types; callers use it to test for optional support.
    pub fn get(&self, component: &str) -> Option<Arc<ComponentSchema>> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.schemas.get(component).cloned())
    }

    pub fn has(&self, component: &str) -> bool {
        self.state
            .read()
            .map(|state| state.schemas.contains_key(component))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .map(|state| state.schemas.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.schemas.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every publish so compiled artifacts can detect staleness.
    pub fn revision(&self) -> u64 {
        self.state.read().map(|state| state.revision).unwrap_or(0)
    }

    pub fn seal(&self) -> Result<()> {
        let mut state = self.state.write().map_err(SyncError::poisoned)?;
        state.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.state.read().map(|state| state.sealed).unwrap_or(true)
    }

    /// Drops every schema and unseals. Test/reset only.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write().map_err(SyncError::poisoned)?;
        state.pending.clear();
        state.schemas.clear();
        state.sealed = false;
        state.revision += 1;
        Ok(())
    }

    /// Canonical IDL for every published component: messages sorted by name,
    /// fields by ascending number.
    pub fn generate_schema(&self) -> String {
        let schemas: Vec<Arc<ComponentSchema>> = self
            .names()
            .iter()
            .filter_map(|name| self.get(name))
            .collect();

        let mut out = String::new();
        let _ = writeln!(out, "syntax = \"proto3\";");
        let _ = writeln!(out, "package {};", IDL_PACKAGE);

        for schema in &schemas {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "// version {} sync {:?} frequency {} priority {}",
                schema.options.version,
                schema.options.sync_mode,
                schema.options.sync_frequency,
                schema.options.network_priority
            );
            let _ = writeln!(out, "message {} {{", schema.name);

            for field in schema.fields_by_number() {
                let _ = writeln!(out, "  {}", self.field_line(field));
            }

            let _ = writeln!(out, "}}");
        }

        out
    }

    fn field_line(&self, field: &FieldDescriptor) -> String {
        let label = if field.repeated {
            "repeated "
        } else if field.optional {
            "optional "
        } else {
            ""
        };

        let type_name = match (field.field_type, &field.type_name) {
            (FieldType::Message, Some(name)) if self.has(name) => name.as_str(),
            (FieldType::Message, _) => STRUCT_TYPE_NAME,
            (other, _) => other.idl_name(),
        };

        let mut options = Vec::new();
        if let Some(precision) = field.precision {
            options.push(format!("precision = {:?}", precision));
        }
        if field.field_type == FieldType::Enum {
            options.push("enum = true".to_string());
        }

        if options.is_empty() {
            format!("{}{} {} = {};", label, type_name, field.name, field.number)
        } else {
            format!(
                "{}{} {} = {} [{}];",
                label,
                type_name,
                field.name,
                field.number,
                options.join(", ")
            )
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SchemaRegistry {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Declarative registration: `registry.component("Position").field(1, "x", FieldType::Float)?`.
pub struct ComponentBuilder<'a> {
    registry: &'a SchemaRegistry,
    name: String,
    options: ComponentOptions,
}

impl<'a> ComponentBuilder<'a> {
    /// Registers immediately, so collisions fail at the offending call.
    pub fn field(self, number: FieldNumber, name: &str, field_type: FieldType) -> Result<Self> {
        self.field_with(number, name, field_type, FieldOptions::default())
    }

    pub fn field_with(
        self,
        number: FieldNumber,
        name: &str,
        field_type: FieldType,
        options: FieldOptions,
    ) -> Result<Self> {
        self.registry
            .register_field(&self.name, number, name, field_type, options)?;
        Ok(self)
    }

    pub fn options(mut self, options: ComponentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.options.version = version;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.options.sync_mode = mode;
        self
    }

    pub fn register(self) -> Result<Arc<ComponentSchema>> {
        self.registry.register_component(&self.name, self.options)
    }
}
