//! Schema-typed codec: compact binary payloads for components with a
//! registered schema.

use crate::component::NetComponent;
use crate::debug::{trace_deserialization, trace_serialization};
use crate::error::{Result, SyncError};
use crate::idl::{CompiledIdl, CompiledMessage};
use crate::protocol::{CodecKind, FieldMap, FieldType, FieldValue, SerializedData};
use crate::schema::{ComponentSchema, FieldDescriptor, SchemaRegistry};
use crate::wire;
use ahash::AHashMap;
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaCodecConfig {
    /// Check field values against the schema before encoding.
    pub validate: bool,
    pub max_cache_size: usize,
    /// Share of the handle cache dropped once it grows past `max_cache_size`.
    pub eviction_fraction: f64,
}

impl SchemaCodecConfig {
    pub fn development() -> Self {
        Self {
            validate: true,
            max_cache_size: 128,
            eviction_fraction: 0.2,
        }
    }

    pub fn production() -> Self {
        Self {
            validate: false,
            ..Self::development()
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate = enabled;
        self
    }

    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size.max(1);
        self
    }

    pub fn with_eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

impl Default for SchemaCodecConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::development()
        } else {
            Self::production()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Keep going past failed items and report them instead of aborting.
    pub continue_on_error: bool,
}

impl BatchOptions {
    pub fn lenient() -> Self {
        Self {
            continue_on_error: true,
        }
    }
}

#[derive(Debug)]
pub struct BatchError {
    /// Input positions that failed with this error.
    pub indices: Vec<usize>,
    pub component_type: String,
    pub error: SyncError,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    /// One slot per input component, `None` where encoding failed.
    pub items: Vec<Option<SerializedData>>,
    pub errors: Vec<BatchError>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &SerializedData> {
        self.items.iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaCodecStats {
    pub encoded: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub compilations: u64,
}

/// Everything needed to encode one component type.
pub struct SchemaHandle {
    idl: Arc<CompiledIdl>,
    message: Arc<CompiledMessage>,
    schema: Arc<ComponentSchema>,
}

impl SchemaHandle {
    pub fn schema(&self) -> &ComponentSchema {
        &self.schema
    }

    pub fn message(&self) -> &CompiledMessage {
        &self.message
    }
}

struct CacheEntry {
    handle: Arc<SchemaHandle>,
    last_access: u64,
}

#[derive(Default)]
struct CodecState {
    compiled: Option<(u64, Arc<CompiledIdl>)>,
    handles: AHashMap<String, CacheEntry>,
    clock: u64,
    stats: SchemaCodecStats,
}

impl CodecState {
    fn evict(&mut self, max: usize, fraction: f64) {
        if self.handles.len() <= max {
            return;
        }

        let len = self.handles.len();
        let count = ((len as f64 * fraction).ceil() as usize).clamp(1, len - 1);

        let mut by_age: Vec<(u64, String)> = self
            .handles
            .iter()
            .map(|(name, entry)| (entry.last_access, name.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, name) in by_age.into_iter().take(count) {
            self.handles.remove(&name);
        }

        self.stats.evictions += count as u64;
        log::debug!("Evicted {} schema handles ({} cached)", count, self.handles.len());
    }
}

pub struct SchemaCodec {
    registry: SchemaRegistry,
    config: SchemaCodecConfig,
    state: Mutex<CodecState>,
}

impl SchemaCodec {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self::with_config(registry, SchemaCodecConfig::default())
    }

    pub fn with_config(registry: SchemaRegistry, config: SchemaCodecConfig) -> Self {
        Self {
            registry,
            config,
            state: Mutex::new(CodecState::default()),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchemaCodecConfig {
        &self.config
    }

    pub fn supports(&self, component_type: &str) -> bool {
        self.registry.has(component_type)
    }

    pub fn stats(&self) -> SchemaCodecStats {
        self.state.lock().map(|state| state.stats).unwrap_or_default()
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().map(|state| state.handles.len()).unwrap_or(0)
    }

    /// Drops compiled handles and the compiled IDL. Statistics are kept.
    pub fn clear_cache(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(SyncError::poisoned)?;
        state.handles.clear();
        state.compiled = None;
        Ok(())
    }

    /// Looks up (or compiles) the handle for `component_type`.
    pub fn handle(&self, component_type: &str) -> Result<Arc<SchemaHandle>> {
        let revision = self.registry.revision();
        let mut state = self.state.lock().map_err(SyncError::poisoned)?;

        let stale = !matches!(&state.compiled, Some((compiled_at, _)) if *compiled_at == revision);
        if stale {
            let idl = CompiledIdl::compile(&self.registry.generate_schema())?;
            log::debug!("Compiled {} schemas at registry revision {}", idl.len(), revision);
            state.compiled = Some((revision, Arc::new(idl)));
            state.handles.clear();
            state.stats.compilations += 1;
        }

        state.clock += 1;
        let now = state.clock;

        if let Some(entry) = state.handles.get_mut(component_type) {
            entry.last_access = now;
            let handle = Arc::clone(&entry.handle);
            state.stats.cache_hits += 1;
            return Ok(handle);
        }
        state.stats.cache_misses += 1;

        let idl = match &state.compiled {
            Some((_, idl)) => Arc::clone(idl),
            None => return Err(SyncError::UnregisteredSchema(component_type.to_string())),
        };
        let unregistered = || SyncError::UnregisteredSchema(component_type.to_string());
        let schema = self.registry.get(component_type).ok_or_else(unregistered)?;
        let message = idl.message(component_type).ok_or_else(unregistered)?;

        let handle = Arc::new(SchemaHandle {
            idl,
            message,
            schema,
        });
        state.handles.insert(
            component_type.to_string(),
            CacheEntry {
                handle: Arc::clone(&handle),
                last_access: now,
            },
        );
        state.evict(self.config.max_cache_size, self.config.eviction_fraction);

        Ok(handle)
    }

    pub fn serialize(&self, component: &dyn NetComponent) -> Result<SerializedData> {
        let handle = self.handle(component.type_name())?;
        self.encode_with(&handle, component)
    }

    fn encode_with(&self, handle: &SchemaHandle, component: &dyn NetComponent) -> Result<SerializedData> {
        let start = Instant::now();
        let component_type = component.type_name();
        let fields = component.to_fields();

        if self.config.validate && handle.schema.options.validate {
            validate_fields(&handle.schema, &fields)?;
        }

        let mut buf = BytesMut::new();
        wire::encode_message(&handle.idl, &handle.message, &fields, &mut buf)?;

        let data = SerializedData::schema(
            component_type,
            buf.to_vec(),
            handle.message.full_name.clone(),
            handle.schema.version(),
        );

        if let Ok(mut state) = self.state.lock() {
            state.stats.encoded += 1;
        }
        trace_serialization("schema", component_type, data.size, start.elapsed().as_micros());

        Ok(data)
    }

    /// Applies `data` to `component`. Malformed payloads are logged and leave
    /// the component untouched (`Ok(false)`); envelope or registration
    /// mistakes are errors.
    pub fn deserialize(&self, component: &mut dyn NetComponent, data: &SerializedData) -> Result<bool> {
        if data.kind != CodecKind::Schema {
            return Err(SyncError::WrongEnvelopeType {
                expected: CodecKind::Schema,
                actual: data.kind,
            });
        }

        if data.component_type != component.type_name() {
            log::warn!(
                "Schema payload for '{}' cannot be applied to '{}'",
                data.component_type,
                component.type_name()
            );
            return Ok(false);
        }

        let start = Instant::now();
        let handle = self.handle(&data.component_type)?;

        let applied = wire::decode_message(&handle.idl, &handle.message, &data.data)
            .and_then(|fields| component.apply_fields(&fields));

        let mut state = self.state.lock().map_err(SyncError::poisoned)?;
        match applied {
            Ok(()) => {
                state.stats.decoded += 1;
                drop(state);
                trace_deserialization("schema", &data.component_type, data.size, start.elapsed().as_micros());
                Ok(true)
            }
            Err(e) => {
                state.stats.decode_failures += 1;
                log::warn!("Failed to decode '{}' payload: {}", data.component_type, e);
                Ok(false)
            }
        }
    }

    /// Decodes a payload without a component instance.
    pub fn decode_fields(&self, data: &SerializedData) -> Result<FieldMap> {
        if data.kind != CodecKind::Schema {
            return Err(SyncError::WrongEnvelopeType {
                expected: CodecKind::Schema,
                actual: data.kind,
            });
        }

        let handle = self.handle(&data.component_type)?;
        wire::decode_message(&handle.idl, &handle.message, &data.data)
    }

    pub fn validate(&self, component_type: &str, fields: &FieldMap) -> Result<()> {
        let schema = self
            .registry
            .get(component_type)
            .ok_or_else(|| SyncError::UnregisteredSchema(component_type.to_string()))?;
        validate_fields(&schema, fields)
    }

    /// Encodes many components, resolving each type's handle once.
    ///
    /// Output order matches input order. Without `continue_on_error` the first
    /// failure is returned as the error.
    pub fn serialize_batch(
        &self,
        components: &[&dyn NetComponent],
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: AHashMap<&str, Vec<usize>> = AHashMap::new();
        for (index, component) in components.iter().enumerate() {
            let name = component.type_name();
            groups
                .entry(name)
                .or_insert_with(|| {
                    order.push(name);
                    Vec::new()
                })
                .push(index);
        }

        let mut result = BatchResult {
            items: vec![None; components.len()],
            errors: Vec::new(),
        };

        for name in order {
            let indices = groups.remove(name).unwrap_or_default();

            let handle = match self.handle(name) {
                Ok(handle) => handle,
                Err(error) if options.continue_on_error => {
                    result.errors.push(BatchError {
                        indices,
                        component_type: name.to_string(),
                        error,
                    });
                    continue;
                }
                Err(error) => return Err(error),
            };

            for index in indices {
                match self.encode_with(&handle, components[index]) {
                    Ok(data) => result.items[index] = Some(data),
                    Err(error) if options.continue_on_error => result.errors.push(BatchError {
                        indices: vec![index],
                        component_type: name.to_string(),
                        error,
                    }),
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(result)
    }
}

fn validate_fields(schema: &ComponentSchema, fields: &FieldMap) -> Result<()> {
    let invalid = |message: String| SyncError::Validation {
        component: schema.name.clone(),
        message,
    };

    for (name, value) in fields {
        let field = schema
            .get_field(name)
            .ok_or_else(|| invalid(format!("unknown field '{}'", name)))?;

        if value.is_null() {
            if field.optional || field.repeated {
                continue;
            }
            return Err(invalid(format!("field '{}' is not optional", name)));
        }

        let ok = if field.repeated {
            value
                .as_repeated()
                .map(|items| items.iter().all(|item| value_fits(field, item)))
                .unwrap_or(false)
        } else {
            value_fits(field, value)
        };

        if !ok {
            return Err(invalid(format!(
                "field '{}' expects {}{:?}, got {}",
                name,
                if field.repeated { "repeated " } else { "" },
                field.field_type,
                value.type_label()
            )));
        }
    }

    Ok(())
}

fn value_fits(field: &FieldDescriptor, value: &FieldValue) -> bool {
    match field.field_type {
        FieldType::Bool => value.as_bool().is_some(),
        FieldType::Int32 | FieldType::Enum => value.as_i32().is_some(),
        FieldType::Int64 => value.as_i64().is_some(),
        FieldType::Uint32 => value.as_u32().is_some(),
        FieldType::Uint64 => value.as_u64().is_some(),
        FieldType::Float | FieldType::Double => match value.as_f64() {
            Some(v) => field.precision.is_none() || v.is_finite(),
            None => false,
        },
        FieldType::String => value.as_str().is_some(),
        FieldType::Bytes => value.as_bytes().is_some(),
        FieldType::Timestamp => value.as_timestamp().is_some(),
        FieldType::Message | FieldType::Struct => value.as_message().is_some(),
    }
}
