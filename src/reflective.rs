//! Reflective JSON codec for components without a schema.
//!
//! Components opt in per property with [`SyncVar`] metadata. The payload is a
//! UTF-8 JSON envelope `{"componentType": ..., "fields": {...}}`.

use crate::component::NetComponent;
use crate::debug::{trace_deserialization, trace_serialization};
use crate::delta::ChangeContext;
use crate::error::{Result, SyncError};
use crate::protocol::{CodecKind, FieldMap, FieldValue, SerializedData};
use crate::schema::SyncPriority;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Expected JSON shape of a sync var, used to rebuild typed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    UInt,
    Float,
    String,
    Bytes,
    /// Epoch milliseconds.
    Date,
    Object,
    Array(Box<ValueKind>),
}

pub type CompareFn = fn(&FieldValue, &FieldValue) -> bool;

/// Replication metadata for one component property.
#[derive(Clone)]
pub struct SyncVar {
    pub name: String,
    pub kind: ValueKind,
    pub priority: SyncPriority,
    pub throttle_ms: u64,
    /// When false the property counts as changed on every comparison.
    pub delta: bool,
    /// Equality override; returns true when the two values count as equal.
    pub compare: Option<CompareFn>,
}

impl SyncVar {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: SyncPriority::Medium,
            throttle_ms: 0,
            delta: true,
            compare: None,
        }
    }

    pub fn with_priority(mut self, priority: SyncPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_throttle(mut self, millis: u64) -> Self {
        self.throttle_ms = millis;
        self
    }

    pub fn with_delta(mut self, enabled: bool) -> Self {
        self.delta = enabled;
        self
    }

    pub fn with_compare(mut self, compare: CompareFn) -> Self {
        self.compare = Some(compare);
        self
    }

    pub fn changed(&self, current: Option<&FieldValue>, base: Option<&FieldValue>) -> bool {
        if !self.delta {
            return true;
        }

        match (current, base) {
            (Some(c), Some(b)) => match self.compare {
                Some(equal) => !equal(c, b),
                None => !c.same_value(b),
            },
            (None, None) => false,
            _ => true,
        }
    }
}

impl std::fmt::Debug for SyncVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncVar")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("throttle_ms", &self.throttle_ms)
            .field("delta", &self.delta)
            .field("custom_compare", &self.compare.is_some())
            .finish()
    }
}

static GLOBAL_SYNC_VARS: Lazy<ReflectiveRegistry> = Lazy::new(ReflectiveRegistry::new);

/// Sync var declarations per component type.
pub struct ReflectiveRegistry {
    vars: Arc<RwLock<AHashMap<String, Arc<Vec<SyncVar>>>>>,
}

impl ReflectiveRegistry {
    pub fn new() -> Self {
        Self {
            vars: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn global() -> ReflectiveRegistry {
        GLOBAL_SYNC_VARS.clone()
    }

    /// Replaces the declarations for `component`.
    pub fn register(&self, component: &str, vars: Vec<SyncVar>) -> Result<()> {
        if component.is_empty() {
            return Err(SyncError::MissingTypeName);
        }

        let mut map = self.vars.write().map_err(SyncError::poisoned)?;
        map.insert(component.to_string(), Arc::new(vars));
        Ok(())
    }

    /// Adds or replaces a single property declaration.
    pub fn add_var(&self, component: &str, var: SyncVar) -> Result<()> {
        if component.is_empty() {
            return Err(SyncError::MissingTypeName);
        }

        let mut map = self.vars.write().map_err(SyncError::poisoned)?;
        let mut vars: Vec<SyncVar> = map
            .get(component)
            .map(|existing| existing.as_ref().clone())
            .unwrap_or_default();

        match vars.iter_mut().find(|v| v.name == var.name) {
            Some(slot) => *slot = var,
            None => vars.push(var),
        }

        map.insert(component.to_string(), Arc::new(vars));
        Ok(())
    }

    pub fn get(&self, component: &str) -> Option<Arc<Vec<SyncVar>>> {
        self.vars.read().ok().and_then(|map| map.get(component).cloned())
    }

    pub fn has(&self, component: &str) -> bool {
        self.vars
            .read()
            .map(|map| map.contains_key(component))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vars
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn clear(&self) -> Result<()> {
        self.vars.write().map_err(SyncError::poisoned)?.clear();
        Ok(())
    }
}

impl Default for ReflectiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ReflectiveRegistry {
    fn clone(&self) -> Self {
        Self {
            vars: Arc::clone(&self.vars),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReflectiveStats {
    pub serialize_count: u64,
    pub deserialize_count: u64,
    pub error_count: u64,
    /// Running mean of serialized payload sizes in bytes.
    pub average_size: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    component_type: String,
    fields: Map<String, Value>,
    /// Value variant per field. Only untyped envelopes carry these, since they
    /// have no sync vars to shape the decoded values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    kinds: BTreeMap<String, String>,
}

pub struct ReflectiveCodec {
    registry: ReflectiveRegistry,
    stats: Mutex<ReflectiveStats>,
}

impl ReflectiveCodec {
    pub fn new(registry: ReflectiveRegistry) -> Self {
        Self {
            registry,
            stats: Mutex::new(ReflectiveStats::default()),
        }
    }

    pub fn registry(&self) -> &ReflectiveRegistry {
        &self.registry
    }

    pub fn supports(&self, component_type: &str) -> bool {
        self.registry.has(component_type)
    }

    pub fn stats(&self) -> ReflectiveStats {
        self.stats.lock().map(|stats| *stats).unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = ReflectiveStats::default();
        }
    }

    /// Encodes the declared sync vars. `None` when the type declares none.
    pub fn serialize(&self, component: &dyn NetComponent) -> Result<Option<SerializedData>> {
        let vars = match self.registry.get(component.type_name()) {
            Some(vars) if !vars.is_empty() => vars,
            _ => return Ok(None),
        };

        let fields = component.to_fields();
        let selected = vars
            .iter()
            .filter_map(|var| fields.get(&var.name).map(|value| (var.name.clone(), encode_value(value))))
            .collect();

        self.write_envelope(component.type_name(), selected, BTreeMap::new())
            .map(Some)
    }

    /// Encodes every field the component reports, with no declarations needed.
    pub fn serialize_untyped(&self, component: &dyn NetComponent) -> Result<SerializedData> {
        let fields = component.to_fields();
        let selected = fields
            .iter()
            .map(|(name, value)| (name.clone(), encode_value(value)))
            .collect();
        let kinds = fields
            .iter()
            .map(|(name, value)| (name.clone(), value_tag(value)))
            .collect();

        self.write_envelope(component.type_name(), selected, kinds)
    }

    fn write_envelope(
        &self,
        component_type: &str,
        fields: Map<String, Value>,
        kinds: BTreeMap<String, String>,
    ) -> Result<SerializedData> {
        let start = Instant::now();
        let envelope = Envelope {
            component_type: component_type.to_string(),
            fields,
            kinds,
        };

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_error();
                return Err(e.into());
            }
        };

        let data = SerializedData::reflective(component_type, bytes);
        if let Ok(mut stats) = self.stats.lock() {
            stats.serialize_count += 1;
            stats.average_size += (data.size as f64 - stats.average_size) / stats.serialize_count as f64;
        }
        trace_serialization("reflective", component_type, data.size, start.elapsed().as_micros());

        Ok(data)
    }

    fn record_error(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.error_count += 1;
        }
    }

    /// Applies `data` to `component`. Malformed JSON, mismatched component
    /// types and rejected values are logged and leave it untouched.
    pub fn deserialize(&self, component: &mut dyn NetComponent, data: &SerializedData) -> Result<bool> {
        if data.kind != CodecKind::Reflective {
            return Err(SyncError::WrongEnvelopeType {
                expected: CodecKind::Reflective,
                actual: data.kind,
            });
        }

        let start = Instant::now();
        let envelope: Envelope = match serde_json::from_slice(&data.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.record_error();
                log::warn!("Malformed reflective payload for '{}': {}", data.component_type, e);
                return Ok(false);
            }
        };

        if envelope.component_type != component.type_name() {
            self.record_error();
            log::warn!(
                "Reflective payload for '{}' cannot be applied to '{}'",
                envelope.component_type,
                component.type_name()
            );
            return Ok(false);
        }

        let applied = self
            .decode_envelope(&envelope)
            .and_then(|fields| component.apply_fields(&fields));

        if let Err(e) = applied {
            self.record_error();
            log::warn!("Failed to apply '{}' payload: {}", envelope.component_type, e);
            return Ok(false);
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.deserialize_count += 1;
        }
        trace_deserialization("reflective", &data.component_type, data.size, start.elapsed().as_micros());

        Ok(true)
    }

    pub fn decode_fields(&self, data: &SerializedData) -> Result<FieldMap> {
        if data.kind != CodecKind::Reflective {
            return Err(SyncError::WrongEnvelopeType {
                expected: CodecKind::Reflective,
                actual: data.kind,
            });
        }

        let envelope: Envelope = serde_json::from_slice(&data.data)?;
        self.decode_envelope(&envelope)
    }

    fn decode_envelope(&self, envelope: &Envelope) -> Result<FieldMap> {
        let vars = self.registry.get(&envelope.component_type);

        envelope
            .fields
            .iter()
            .map(|(name, json)| {
                let kind = vars
                    .as_ref()
                    .and_then(|vars| vars.iter().find(|v| &v.name == name))
                    .map(|var| &var.kind);

                let decoded = match (kind, envelope.kinds.get(name)) {
                    (Some(kind), _) => decode_value(kind, json),
                    (None, Some(tag)) => decode_tagged(tag, json),
                    (None, None) => decode_value(&ValueKind::Any, json),
                };

                decoded
                    .map(|value| (name.clone(), value))
                    .ok_or_else(|| SyncError::FieldType {
                        component: envelope.component_type.clone(),
                        field: name.clone(),
                        expected: kind.map(kind_label).unwrap_or("tagged value"),
                    })
            })
            .collect()
    }

    /// Names of properties that differ, honouring each var's `delta` flag and
    /// custom compare.
    pub fn changed_fields(&self, component_type: &str, current: &FieldMap, base: &FieldMap) -> Vec<String> {
        let vars = self.registry.get(component_type);
        let context = ChangeContext {
            component_type,
            baseline: base,
            schema: None,
            sync_vars: vars.as_deref().map(Vec::as_slice),
        };
        context.changed_fields(current)
    }
}

impl Default for ReflectiveCodec {
    fn default() -> Self {
        Self::new(ReflectiveRegistry::new())
    }
}

fn kind_label(kind: &ValueKind) -> &'static str {
    match kind {
        ValueKind::Any => "any",
        ValueKind::Bool => "bool",
        ValueKind::Int => "integer",
        ValueKind::UInt => "unsigned integer",
        ValueKind::Float => "number",
        ValueKind::String => "string",
        ValueKind::Bytes => "byte array",
        ValueKind::Date => "epoch milliseconds",
        ValueKind::Object => "object",
        ValueKind::Array(_) => "array",
    }
}

/// Field value to JSON. Non-finite floats become `null`.
pub fn encode_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::I32(v) | FieldValue::Enum(v) => Value::from(*v),
        FieldValue::I64(v) | FieldValue::Timestamp(v) => Value::from(*v),
        FieldValue::U32(v) => Value::from(*v),
        FieldValue::U64(v) => Value::from(*v),
        FieldValue::F32(v) => Number::from_f64(*v as f64).map(Value::Number).unwrap_or(Value::Null),
        FieldValue::F64(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
        FieldValue::String(s) => Value::String(s.clone()),
        FieldValue::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        FieldValue::Message(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect(),
        ),
        FieldValue::Repeated(items) => Value::Array(items.iter().map(encode_value).collect()),
    }
}

/// JSON to field value, shaped by `kind`. `None` if the JSON does not fit.
pub fn decode_value(kind: &ValueKind, json: &Value) -> Option<FieldValue> {
    if json.is_null() {
        return Some(FieldValue::Null);
    }

    match kind {
        ValueKind::Any => Some(infer_value(json)),
        ValueKind::Bool => json.as_bool().map(FieldValue::Bool),
        ValueKind::Int => json.as_i64().map(FieldValue::I64),
        ValueKind::UInt => json.as_u64().map(FieldValue::U64),
        ValueKind::Float => json.as_f64().map(FieldValue::F64),
        ValueKind::String => json.as_str().map(|s| FieldValue::String(s.to_string())),
        ValueKind::Bytes => json
            .as_array()?
            .iter()
            .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(FieldValue::Bytes),
        ValueKind::Date => json
            .as_i64()
            .or_else(|| json.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
            .map(FieldValue::Timestamp),
        ValueKind::Object => json.as_object().map(|_| infer_value(json)),
        ValueKind::Array(inner) => json
            .as_array()?
            .iter()
            .map(|item| decode_value(inner, item))
            .collect::<Option<Vec<FieldValue>>>()
            .map(FieldValue::Repeated),
    }
}

/// Variant tag recorded by untyped envelopes: the value's type label, with
/// repeated values tagged after their first item.
fn value_tag(value: &FieldValue) -> String {
    match value {
        FieldValue::Repeated(items) => match items.first() {
            Some(first) => format!("repeated:{}", value_tag(first)),
            None => "repeated".to_string(),
        },
        other => other.type_label().to_string(),
    }
}

fn decode_tagged(tag: &str, json: &Value) -> Option<FieldValue> {
    if json.is_null() {
        return Some(FieldValue::Null);
    }

    if let Some(inner) = tag.strip_prefix("repeated:") {
        return json
            .as_array()?
            .iter()
            .map(|item| decode_tagged(inner, item))
            .collect::<Option<Vec<FieldValue>>>()
            .map(FieldValue::Repeated);
    }

    match tag {
        "bool" => json.as_bool().map(FieldValue::Bool),
        "i32" => json.as_i64().and_then(|v| i32::try_from(v).ok()).map(FieldValue::I32),
        "enum" => json.as_i64().and_then(|v| i32::try_from(v).ok()).map(FieldValue::Enum),
        "i64" => json.as_i64().map(FieldValue::I64),
        "timestamp" => json.as_i64().map(FieldValue::Timestamp),
        "u32" => json.as_u64().and_then(|v| u32::try_from(v).ok()).map(FieldValue::U32),
        "u64" => json.as_u64().map(FieldValue::U64),
        "f32" => json.as_f64().map(|v| FieldValue::F32(v as f32)),
        "f64" => json.as_f64().map(FieldValue::F64),
        "string" => json.as_str().map(|s| FieldValue::String(s.to_string())),
        "bytes" => decode_value(&ValueKind::Bytes, json),
        _ => Some(infer_value(json)),
    }
}

fn infer_value(json: &Value) -> FieldValue {
    match json {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                FieldValue::I64(v)
            } else if let Some(v) = n.as_u64() {
                FieldValue::U64(v)
            } else {
                FieldValue::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Array(items) => FieldValue::Repeated(items.iter().map(infer_value).collect()),
        Value::Object(map) => FieldValue::Message(
            map.iter()
                .map(|(k, v)| (k.clone(), infer_value(v)))
                .collect(),
        ),
    }
}
