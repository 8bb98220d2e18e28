use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type EntityId = u32;
pub type ComponentId = u32;
pub type FieldNumber = u32;

/// Field values keyed by field name. Ordered so encodings are deterministic.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single synchronizable value.
///
/// There is deliberately no variant that can hold an entity handle, so a
/// component's owner can never end up inside a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Enum(i32),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Message(FieldMap),
    Repeated(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::I32(_) => "i32",
            FieldValue::I64(_) => "i64",
            FieldValue::U32(_) => "u32",
            FieldValue::U64(_) => "u64",
            FieldValue::F32(_) => "f32",
            FieldValue::F64(_) => "f64",
            FieldValue::String(_) => "string",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Enum(_) => "enum",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Message(_) => "message",
            FieldValue::Repeated(_) => "repeated",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of any integral variant that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I32(v) | FieldValue::Enum(v) => Some(*v as i64),
            FieldValue::I64(v) | FieldValue::Timestamp(v) => Some(*v),
            FieldValue::U32(v) => Some(*v as i64),
            FieldValue::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            FieldValue::I32(_) | FieldValue::I64(_) | FieldValue::Enum(_) => {
                self.as_i64().and_then(|v| u64::try_from(v).ok())
            }
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    /// Floating view of any numeric variant.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F32(v) => Some(*v as f64),
            FieldValue::F64(v) => Some(*v),
            FieldValue::I32(v) => Some(*v as f64),
            FieldValue::I64(v) => Some(*v as f64),
            FieldValue::U32(v) => Some(*v as f64),
            FieldValue::U64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            FieldValue::Timestamp(ms) | FieldValue::I64(ms) => Some(*ms),
            FieldValue::I32(ms) => Some(*ms as i64),
            FieldValue::U32(ms) => Some(*ms as i64),
            FieldValue::U64(ms) => i64::try_from(*ms).ok(),
            _ => None,
        }
    }

    pub fn as_repeated(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Repeated(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&FieldMap> {
        match self {
            FieldValue::Message(map) => Some(map),
            _ => None,
        }
    }
    /// Equality that ignores the numeric width a codec decoded into, so
    /// `I32(5)` matches `I64(5)` and `F32(x)` matches `F64(x as f64)`.
    pub fn same_value(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Repeated(a), FieldValue::Repeated(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (FieldValue::Message(a), FieldValue::Message(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| v.same_value(w)))
            }
            _ => match (self.as_i128(), other.as_i128()) {
                (Some(a), Some(b)) => a == b,
                _ => match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => self == other,
                },
            },
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            FieldValue::I32(v) | FieldValue::Enum(v) => Some(*v as i128),
            FieldValue::I64(v) | FieldValue::Timestamp(v) => Some(*v as i128),
            FieldValue::U32(v) => Some(*v as i128),
            FieldValue::U64(v) => Some(*v as i128),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U32(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::F32(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Bool = 0,
    Int32 = 1,
    Int64 = 2,
    Uint32 = 3,
    Uint64 = 4,
    Float = 5,
    Double = 6,
    String = 7,
    Bytes = 8,
    Message = 9,
    Enum = 10,
    Timestamp = 11,
    Struct = 12,
}

pub const TIMESTAMP_TYPE_NAME: &str = "google.protobuf.Timestamp";
pub const STRUCT_TYPE_NAME: &str = "google.protobuf.Struct";

impl FieldType {
    /// Scalar spelling in the generated IDL. Message and enum fields are
    /// spelled by their referenced type name instead.
    pub fn idl_name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Message => STRUCT_TYPE_NAME,
            FieldType::Enum => "int32",
            FieldType::Timestamp => TIMESTAMP_TYPE_NAME,
            FieldType::Struct => STRUCT_TYPE_NAME,
        }
    }

    pub fn from_idl(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => FieldType::Bool,
            "int32" | "sint32" => FieldType::Int32,
            "int64" | "sint64" => FieldType::Int64,
            "uint32" => FieldType::Uint32,
            "uint64" => FieldType::Uint64,
            "float" => FieldType::Float,
            "double" => FieldType::Double,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            TIMESTAMP_TYPE_NAME => FieldType::Timestamp,
            STRUCT_TYPE_NAME => FieldType::Struct,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Bool
                | FieldType::Int32
                | FieldType::Int64
                | FieldType::Uint32
                | FieldType::Uint64
                | FieldType::Float
                | FieldType::Double
                | FieldType::Enum
        )
    }

    /// Zero value a decoder substitutes for an absent, non-optional field.
    pub fn default_value(&self) -> FieldValue {
        match self {
            FieldType::Bool => FieldValue::Bool(false),
            FieldType::Int32 => FieldValue::I32(0),
            FieldType::Int64 => FieldValue::I64(0),
            FieldType::Uint32 => FieldValue::U32(0),
            FieldType::Uint64 => FieldValue::U64(0),
            FieldType::Float => FieldValue::F32(0.0),
            FieldType::Double => FieldValue::F64(0.0),
            FieldType::String => FieldValue::String(String::new()),
            FieldType::Bytes => FieldValue::Bytes(Vec::new()),
            FieldType::Message | FieldType::Struct => FieldValue::Message(FieldMap::new()),
            FieldType::Enum => FieldValue::Enum(0),
            FieldType::Timestamp => FieldValue::Timestamp(0),
        }
    }
}

/// Which codec produced (and must decode) a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Schema,
    Reflective,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Schema => write!(f, "schema"),
            CodecKind::Reflective => write!(f, "reflective"),
        }
    }
}

/// Wire/cache envelope for one serialized component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedData {
    #[serde(rename = "type")]
    pub kind: CodecKind,
    pub component_type: String,
    pub data: Vec<u8>,
    pub size: usize,
    /// Fully qualified message name, schema codec only.
    pub schema: Option<String>,
    /// Component schema version, schema codec only.
    pub version: Option<u32>,
}

impl SerializedData {
    pub fn schema(component_type: &str, data: Vec<u8>, schema: String, version: u32) -> Self {
        Self {
            kind: CodecKind::Schema,
            component_type: component_type.to_string(),
            size: data.len(),
            data,
            schema: Some(schema),
            version: Some(version),
        }
    }

    pub fn reflective(component_type: &str, data: Vec<u8>) -> Self {
        Self {
            kind: CodecKind::Reflective,
            component_type: component_type.to_string(),
            size: data.len(),
            data,
            schema: None,
            version: None,
        }
    }

    pub fn as_json_str(&self) -> Option<&str> {
        match self.kind {
            CodecKind::Reflective => std::str::from_utf8(&self.data).ok(),
            CodecKind::Schema => None,
        }
    }
}

/// Typed access to a decoded [`FieldMap`] for `apply_fields` implementations.
///
/// Read every field through the reader before assigning anything, so a bad
/// payload leaves the component untouched.
pub struct FieldReader<'a> {
    component: &'a str,
    fields: &'a FieldMap,
}

impl<'a> FieldReader<'a> {
    pub fn new(component: &'a str, fields: &'a FieldMap) -> Self {
        Self { component, fields }
    }

    pub fn get(&self, name: &str) -> Result<&'a FieldValue> {
        self.fields.get(name).ok_or_else(|| SyncError::MissingField {
            component: self.component.to_string(),
            field: name.to_string(),
        })
    }

    /// Absent and null both read as `None`.
    pub fn opt(&self, name: &str) -> Option<&'a FieldValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    fn typed<T>(
        &self,
        name: &str,
        expected: &'static str,
        convert: impl Fn(&'a FieldValue) -> Option<T>,
    ) -> Result<T> {
        convert(self.get(name)?).ok_or_else(|| SyncError::FieldType {
            component: self.component.to_string(),
            field: name.to_string(),
            expected,
        })
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.typed(name, "bool", FieldValue::as_bool)
    }

    pub fn i32(&self, name: &str) -> Result<i32> {
        self.typed(name, "i32", FieldValue::as_i32)
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.typed(name, "i64", FieldValue::as_i64)
    }

    pub fn u32(&self, name: &str) -> Result<u32> {
        self.typed(name, "u32", FieldValue::as_u32)
    }

    pub fn u64(&self, name: &str) -> Result<u64> {
        self.typed(name, "u64", FieldValue::as_u64)
    }

    pub fn f32(&self, name: &str) -> Result<f32> {
        self.typed(name, "f32", FieldValue::as_f32)
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.typed(name, "f64", FieldValue::as_f64)
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.typed(name, "string", |v| v.as_str().map(str::to_string))
    }

    pub fn bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.typed(name, "bytes", |v| v.as_bytes().map(<[u8]>::to_vec))
    }

    pub fn timestamp(&self, name: &str) -> Result<i64> {
        self.typed(name, "timestamp", FieldValue::as_timestamp)
    }

    pub fn repeated(&self, name: &str) -> Result<&'a [FieldValue]> {
        self.typed(name, "repeated", FieldValue::as_repeated)
    }

    pub fn message(&self, name: &str) -> Result<&'a FieldMap> {
        self.typed(name, "message", FieldValue::as_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(FieldValue::U64(7).as_i32(), Some(7));
        assert_eq!(FieldValue::I64(-1).as_u64(), None);
        assert_eq!(FieldValue::I32(3).as_f32(), Some(3.0));
        assert_eq!(FieldValue::F64(1.5).as_i64(), None);
        assert_eq!(FieldValue::U64(u64::MAX).as_i64(), None);
    }

    #[test]
    fn test_same_value_ignores_width() {
        assert!(FieldValue::I32(5).same_value(&FieldValue::I64(5)));
        assert!(FieldValue::U64(5).same_value(&FieldValue::Enum(5)));
        assert!(FieldValue::F32(0.123).same_value(&FieldValue::F64(0.123f32 as f64)));
        assert!(!FieldValue::F32(0.123).same_value(&FieldValue::F64(0.123)));
        assert!(!FieldValue::I32(1).same_value(&FieldValue::Bool(true)));

        let narrow = FieldValue::Repeated(vec![FieldValue::I32(1), FieldValue::F32(2.5)]);
        let wide = FieldValue::Repeated(vec![FieldValue::I64(1), FieldValue::F64(2.5)]);
        assert!(narrow.same_value(&wide));
        assert!(!narrow.same_value(&FieldValue::Repeated(vec![FieldValue::I64(1)])));
    }

    #[test]
    fn test_field_reader_errors() {
        let mut fields = FieldMap::new();
        fields.insert("x".to_string(), FieldValue::F32(1.0));
        fields.insert("label".to_string(), FieldValue::Null);

        let reader = FieldReader::new("Position", &fields);
        assert_eq!(reader.f32("x").unwrap(), 1.0);
        assert!(matches!(reader.f32("y"), Err(SyncError::MissingField { .. })));
        assert!(matches!(reader.string("x"), Err(SyncError::FieldType { expected: "string", .. })));
        assert!(reader.opt("label").is_none());
    }

    #[test]
    fn test_envelope_json_shape() {
        let data = SerializedData::reflective("Health", b"{}".to_vec());
        let json = serde_json::to_value(&data).unwrap();

        assert_eq!(json["type"], "reflective");
        assert_eq!(json["componentType"], "Health");
        assert_eq!(json["size"], 2);
        assert_eq!(data.as_json_str(), Some("{}"));
    }

    #[test]
    fn test_idl_names_round_trip() {
        for ty in [FieldType::Bool, FieldType::Int64, FieldType::Double, FieldType::Timestamp] {
            assert_eq!(FieldType::from_idl(ty.idl_name()), Some(ty));
        }
    }
}
