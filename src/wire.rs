//! Binary framing for the schema codec.
//!
//! Tags follow the protobuf layout (`number << 3 | wire type`). Signed
//! integers and enums are zig-zag varints; floats and doubles carrying a
//! precision are quantised to zig-zag varints of `round(value / precision)`.
//! Timestamps are nested `{1: seconds, 2: nanos}` messages and Struct fields
//! carry JSON bytes.

use crate::error::{Result, SyncError};
use crate::idl::{CompiledField, CompiledIdl, CompiledMessage};
use crate::protocol::{FieldMap, FieldNumber, FieldType, FieldValue};
use bytes::{Buf, BufMut, BytesMut};

const MAX_NESTING: usize = 32;
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(SyncError::Decode(format!("unsupported wire type {}", other))),
        }
    }
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(SyncError::Decode("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(SyncError::Decode("varint overflows 64 bits".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(SyncError::Decode("varint too long".to_string()))
}

pub fn put_tag(buf: &mut BytesMut, number: FieldNumber, wire: WireType) {
    put_varint(buf, ((number as u64) << 3) | wire as u64);
}

pub fn get_tag(buf: &mut &[u8]) -> Result<(FieldNumber, WireType)> {
    let key = get_varint(buf)?;
    let number = key >> 3;
    if number == 0 || number > u32::MAX as u64 {
        return Err(SyncError::Decode(format!("invalid field number {}", number)));
    }
    Ok((number as FieldNumber, WireType::from_bits(key & 0x7)?))
}

pub fn get_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(SyncError::Decode(format!(
            "length {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn put_length_delimited(buf: &mut BytesMut, payload: &[u8]) {
    put_varint(buf, payload.len() as u64);
    buf.put_slice(payload);
}

pub fn skip_field(buf: &mut &[u8], wire: WireType) -> Result<()> {
    let width = match wire {
        WireType::Varint => {
            get_varint(buf)?;
            return Ok(());
        }
        WireType::LengthDelimited => {
            get_length_delimited(buf)?;
            return Ok(());
        }
        WireType::Fixed64 => 8,
        WireType::Fixed32 => 4,
    };
    if buf.remaining() < width {
        return Err(SyncError::Decode("truncated fixed-width field".to_string()));
    }
    buf.advance(width);
    Ok(())
}

/// Wire type a field's individual values are written with.
pub fn wire_type_of(field: &CompiledField) -> WireType {
    match field.field_type {
        FieldType::Float | FieldType::Double if field.precision.is_some() => WireType::Varint,
        FieldType::Float => WireType::Fixed32,
        FieldType::Double => WireType::Fixed64,
        FieldType::Bool
        | FieldType::Int32
        | FieldType::Int64
        | FieldType::Uint32
        | FieldType::Uint64
        | FieldType::Enum => WireType::Varint,
        FieldType::String
        | FieldType::Bytes
        | FieldType::Message
        | FieldType::Timestamp
        | FieldType::Struct => WireType::LengthDelimited,
    }
}

fn is_packable(field: &CompiledField) -> bool {
    wire_type_of(field) != WireType::LengthDelimited
}

fn mismatch(message: &CompiledMessage, field: &CompiledField, value: &FieldValue) -> SyncError {
    SyncError::Encode {
        component: message.name.clone(),
        message: format!(
            "field '{}' expects {:?}, got {}",
            field.name,
            field.field_type,
            value.type_label()
        ),
    }
}

/// Writes `fields` as `message`. Absent and null fields are omitted.
pub fn encode_message(
    idl: &CompiledIdl,
    message: &CompiledMessage,
    fields: &FieldMap,
    buf: &mut BytesMut,
) -> Result<()> {
    encode_nested(idl, message, fields, buf, 0)
}

fn encode_nested(
    idl: &CompiledIdl,
    message: &CompiledMessage,
    fields: &FieldMap,
    buf: &mut BytesMut,
    depth: usize,
) -> Result<()> {
    if depth > MAX_NESTING {
        return Err(SyncError::Encode {
            component: message.name.clone(),
            message: "message nesting too deep".to_string(),
        });
    }

    for field in message.fields() {
        let value = match fields.get(&field.name) {
            None | Some(FieldValue::Null) => continue,
            Some(value) => value,
        };

        if field.repeated {
            let items = value
                .as_repeated()
                .ok_or_else(|| mismatch(message, field, value))?;

            if items.is_empty() {
                continue;
            }

            if is_packable(field) {
                let mut packed = BytesMut::new();
                for item in items {
                    encode_scalar(message, field, item, &mut packed)?;
                }
                put_tag(buf, field.number, WireType::LengthDelimited);
                put_length_delimited(buf, &packed);
            } else {
                for item in items {
                    encode_single(idl, message, field, item, buf, depth)?;
                }
            }
        } else {
            encode_single(idl, message, field, value, buf, depth)?;
        }
    }

    Ok(())
}

fn encode_single(
    idl: &CompiledIdl,
    message: &CompiledMessage,
    field: &CompiledField,
    value: &FieldValue,
    buf: &mut BytesMut,
    depth: usize,
) -> Result<()> {
    let wire = wire_type_of(field);
    if wire != WireType::LengthDelimited {
        put_tag(buf, field.number, wire);
        return encode_scalar(message, field, value, buf);
    }

    let mut payload = BytesMut::new();
    match field.field_type {
        FieldType::String => {
            let s = value.as_str().ok_or_else(|| mismatch(message, field, value))?;
            payload.put_slice(s.as_bytes());
        }
        FieldType::Bytes => {
            let b = value.as_bytes().ok_or_else(|| mismatch(message, field, value))?;
            payload.put_slice(b);
        }
        FieldType::Timestamp => {
            let millis = value.as_timestamp().ok_or_else(|| mismatch(message, field, value))?;
            put_tag(&mut payload, 1, WireType::Varint);
            put_varint(&mut payload, zigzag_encode(millis.div_euclid(1000)));
            put_tag(&mut payload, 2, WireType::Varint);
            put_varint(&mut payload, (millis.rem_euclid(1000) * 1_000_000) as u64);
        }
        FieldType::Message if field.message_type.is_some() => {
            let nested_fields = value.as_message().ok_or_else(|| mismatch(message, field, value))?;
            let nested = field
                .message_type
                .as_deref()
                .and_then(|name| idl.message(name))
                .ok_or_else(|| SyncError::Encode {
                    component: message.name.clone(),
                    message: format!("unresolved message type for field '{}'", field.name),
                })?;
            encode_nested(idl, &nested, nested_fields, &mut payload, depth + 1)?;
        }
        _ => {
            let map = value.as_message().ok_or_else(|| mismatch(message, field, value))?;
            let json = serde_json::to_vec(map)?;
            payload.put_slice(&json);
        }
    }

    put_tag(buf, field.number, WireType::LengthDelimited);
    put_length_delimited(buf, &payload);
    Ok(())
}

fn encode_scalar(
    message: &CompiledMessage,
    field: &CompiledField,
    value: &FieldValue,
    buf: &mut BytesMut,
) -> Result<()> {
    let bad = || mismatch(message, field, value);

    match (field.field_type, field.precision) {
        (FieldType::Bool, _) => put_varint(buf, value.as_bool().ok_or_else(bad)? as u64),
        (FieldType::Int32, _) | (FieldType::Enum, _) => {
            put_varint(buf, zigzag_encode(value.as_i32().ok_or_else(bad)? as i64))
        }
        (FieldType::Int64, _) => put_varint(buf, zigzag_encode(value.as_i64().ok_or_else(bad)?)),
        (FieldType::Uint32, _) => put_varint(buf, value.as_u32().ok_or_else(bad)? as u64),
        (FieldType::Uint64, _) => put_varint(buf, value.as_u64().ok_or_else(bad)?),
        (FieldType::Float, Some(step)) | (FieldType::Double, Some(step)) => {
            let v = value.as_f64().ok_or_else(bad)?;
            let quantised = (v / step).round();
            if !quantised.is_finite() || quantised.abs() >= i64::MAX as f64 {
                return Err(SyncError::Encode {
                    component: message.name.clone(),
                    message: format!("field '{}' value {} cannot be quantised by {}", field.name, v, step),
                });
            }
            put_varint(buf, zigzag_encode(quantised as i64));
        }
        (FieldType::Float, None) => buf.put_f32_le(value.as_f32().ok_or_else(bad)?),
        (FieldType::Double, None) => buf.put_f64_le(value.as_f64().ok_or_else(bad)?),
        _ => return Err(bad()),
    }

    Ok(())
}

/// Reads `data` as `message`, filling zero values for absent non-optional fields.
pub fn decode_message(idl: &CompiledIdl, message: &CompiledMessage, data: &[u8]) -> Result<FieldMap> {
    decode_nested(idl, message, data, 0)
}

fn decode_nested(idl: &CompiledIdl, message: &CompiledMessage, data: &[u8], depth: usize) -> Result<FieldMap> {
    if depth > MAX_NESTING {
        return Err(SyncError::Decode("message nesting too deep".to_string()));
    }

    let mut buf = data;
    let mut out = FieldMap::new();

    while buf.has_remaining() {
        let (number, wire) = get_tag(&mut buf)?;

        let field = match message.field_by_number(number) {
            Some(field) => field,
            None => {
                skip_field(&mut buf, wire)?;
                continue;
            }
        };

        let expected = wire_type_of(field);

        if field.repeated && wire == WireType::LengthDelimited && is_packable(field) {
            let mut packed = get_length_delimited(&mut buf)?;
            let mut items = Vec::new();
            while packed.has_remaining() {
                items.push(decode_scalar(field, &mut packed)?);
            }
            push_repeated(&mut out, &field.name, items);
            continue;
        }

        if wire != expected {
            return Err(SyncError::Decode(format!(
                "field '{}.{}' has wire type {:?}, expected {:?}",
                message.name, field.name, wire, expected
            )));
        }

        let value = if expected == WireType::LengthDelimited {
            let payload = get_length_delimited(&mut buf)?;
            decode_length_delimited(idl, field, payload, depth)?
        } else {
            decode_scalar(field, &mut buf)?
        };

        if field.repeated {
            push_repeated(&mut out, &field.name, vec![value]);
        } else {
            out.insert(field.name.clone(), value);
        }
    }

    for field in message.fields() {
        if out.contains_key(&field.name) {
            continue;
        }
        if field.repeated {
            out.insert(field.name.clone(), FieldValue::Repeated(Vec::new()));
        } else if !field.optional {
            out.insert(field.name.clone(), field.field_type.default_value());
        }
    }

    Ok(out)
}

fn push_repeated(out: &mut FieldMap, name: &str, items: Vec<FieldValue>) {
    match out.get_mut(name) {
        Some(FieldValue::Repeated(existing)) => existing.extend(items),
        _ => {
            out.insert(name.to_string(), FieldValue::Repeated(items));
        }
    }
}

fn decode_scalar(field: &CompiledField, buf: &mut &[u8]) -> Result<FieldValue> {
    let out_of_range = |raw: i128| {
        SyncError::Decode(format!("value {} out of range for field '{}'", raw, field.name))
    };

    Ok(match (field.field_type, field.precision) {
        (FieldType::Bool, _) => FieldValue::Bool(get_varint(buf)? != 0),
        (FieldType::Int32, _) => {
            let v = zigzag_decode(get_varint(buf)?);
            FieldValue::I32(i32::try_from(v).map_err(|_| out_of_range(v as i128))?)
        }
        (FieldType::Enum, _) => {
            let v = zigzag_decode(get_varint(buf)?);
            FieldValue::Enum(i32::try_from(v).map_err(|_| out_of_range(v as i128))?)
        }
        (FieldType::Int64, _) => FieldValue::I64(zigzag_decode(get_varint(buf)?)),
        (FieldType::Uint32, _) => {
            let v = get_varint(buf)?;
            FieldValue::U32(u32::try_from(v).map_err(|_| out_of_range(v as i128))?)
        }
        (FieldType::Uint64, _) => FieldValue::U64(get_varint(buf)?),
        (FieldType::Float, Some(step)) => {
            FieldValue::F32((zigzag_decode(get_varint(buf)?) as f64 * step) as f32)
        }
        (FieldType::Double, Some(step)) => FieldValue::F64(zigzag_decode(get_varint(buf)?) as f64 * step),
        (FieldType::Float, None) => {
            if buf.remaining() < 4 {
                return Err(SyncError::Decode("truncated float".to_string()));
            }
            FieldValue::F32(buf.get_f32_le())
        }
        (FieldType::Double, None) => {
            if buf.remaining() < 8 {
                return Err(SyncError::Decode("truncated double".to_string()));
            }
            FieldValue::F64(buf.get_f64_le())
        }
        (other, _) => {
            return Err(SyncError::Decode(format!(
                "field '{}' of type {:?} is not a scalar",
                field.name, other
            )))
        }
    })
}

fn decode_length_delimited(
    idl: &CompiledIdl,
    field: &CompiledField,
    payload: &[u8],
    depth: usize,
) -> Result<FieldValue> {
    Ok(match field.field_type {
        FieldType::String => FieldValue::String(
            String::from_utf8(payload.to_vec())
                .map_err(|e| SyncError::Decode(format!("field '{}': {}", field.name, e)))?,
        ),
        FieldType::Bytes => FieldValue::Bytes(payload.to_vec()),
        FieldType::Timestamp => {
            let mut buf = payload;
            let mut seconds = 0i64;
            let mut nanos = 0u64;
            while buf.has_remaining() {
                match get_tag(&mut buf)? {
                    (1, WireType::Varint) => seconds = zigzag_decode(get_varint(&mut buf)?),
                    (2, WireType::Varint) => nanos = get_varint(&mut buf)?,
                    (_, wire) => skip_field(&mut buf, wire)?,
                }
            }
            // Seconds are floored, so the millisecond product can leave i64 range
            // before the nanos bring it back.
            let millis = seconds as i128 * 1000 + (nanos / 1_000_000) as i128;
            let millis = i64::try_from(millis)
                .map_err(|_| SyncError::Decode(format!("timestamp overflow in '{}'", field.name)))?;
            FieldValue::Timestamp(millis)
        }
        FieldType::Message if field.message_type.is_some() => {
            let nested = field
                .message_type
                .as_deref()
                .and_then(|name| idl.message(name))
                .ok_or_else(|| SyncError::Decode(format!("unresolved message type for '{}'", field.name)))?;
            FieldValue::Message(decode_nested(idl, &nested, payload, depth + 1)?)
        }
        FieldType::Message | FieldType::Struct => FieldValue::Message(
            serde_json::from_slice(payload)
                .map_err(|e| SyncError::Decode(format!("field '{}': {}", field.name, e)))?,
        ),
        other => {
            return Err(SyncError::Decode(format!(
                "field '{}' of type {:?} is not length-delimited",
                field.name, other
            )))
        }
    })
}
