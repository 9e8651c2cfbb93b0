use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use serde_json::{Map, Value};
use thiserror::Error;

/// Highest valid protobuf field number (2^29 - 1).
const MAX_FIELD_NUMBER: u32 = 536_870_911;

#[derive(Debug, Error)]
pub enum WireCodecError {
    #[error("invalid protobuf tag")]
    InvalidTag,
    #[error("invalid varint for field {0}")]
    InvalidVarint(u32),
    #[error("truncated value for field {0}")]
    Truncated(u32),
    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u32, wire_type: u8 },
    #[error("invalid field number {0:?}")]
    InvalidFieldNumber(String),
    #[error("unsupported JSON value ({kind}) for field {field}")]
    UnsupportedValue { field: u32, kind: &'static str },
    #[error("top-level JSON value must be an object")]
    NotAnObject,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Converts protobuf wire-format bytes into a schema-less JSON tree keyed by
/// decimal field numbers, e.g. `{"1": "hello", "2": 42}`.
///
/// Length-delimited fields are interpreted best-effort: nested message if the
/// bytes decode completely into a non-empty map, printable UTF-8 as a string,
/// anything else as a lowercase hex string.
pub fn wire_to_value(data: &[u8]) -> Result<Value, WireCodecError> {
    Ok(Value::Object(wire_to_map(data)?))
}

/// [`wire_to_value`] rendered as pretty-printed JSON text.
pub fn wire_to_json(data: &[u8]) -> Result<String, WireCodecError> {
    let value = wire_to_value(data)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Converts a schema-less JSON object (field numbers as keys) back into
/// protobuf wire format. Heuristics mirror the decode direction: strings
/// become length-delimited bytes, whole non-negative numbers become varints,
/// other numbers become fixed64 IEEE-754 bits, booleans become varint 0/1,
/// and objects become nested messages. Output is deterministic: fields are
/// emitted in ascending field-number order.
pub fn json_to_wire(text: &str) -> Result<Vec<u8>, WireCodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(WireCodecError::NotAnObject);
    };
    map_to_wire(&map)
}

fn wire_to_map(mut data: &[u8]) -> Result<Map<String, Value>, WireCodecError> {
    let mut map = Map::new();
    while !data.is_empty() {
        let (field, wire_type) =
            decode_key(&mut data).map_err(|_| WireCodecError::InvalidTag)?;
        let value = match wire_type {
            WireType::Varint => Value::from(
                decode_varint(&mut data).map_err(|_| WireCodecError::InvalidVarint(field))?,
            ),
            WireType::ThirtyTwoBit => {
                if data.len() < 4 {
                    return Err(WireCodecError::Truncated(field));
                }
                let raw = u32::from_le_bytes(data[..4].try_into().expect("4 bytes"));
                data = &data[4..];
                Value::from(raw)
            }
            WireType::SixtyFourBit => {
                if data.len() < 8 {
                    return Err(WireCodecError::Truncated(field));
                }
                let raw = u64::from_le_bytes(data[..8].try_into().expect("8 bytes"));
                data = &data[8..];
                Value::from(raw)
            }
            WireType::LengthDelimited => {
                let length = decode_varint(&mut data)
                    .map_err(|_| WireCodecError::InvalidVarint(field))?
                    as usize;
                if data.len() < length {
                    return Err(WireCodecError::Truncated(field));
                }
                let (payload, rest) = data.split_at(length);
                data = rest;
                decode_length_delimited(payload)
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(WireCodecError::UnsupportedWireType {
                    field,
                    wire_type: wire_type as u8,
                });
            }
        };
        map.insert(field.to_string(), value);
    }
    Ok(map)
}

fn decode_length_delimited(payload: &[u8]) -> Value {
    if let Ok(nested) = wire_to_map(payload) {
        if !nested.is_empty() {
            return Value::Object(nested);
        }
    }
    match std::str::from_utf8(payload) {
        Ok(text) if is_printable(payload) => Value::String(text.to_string()),
        _ => Value::String(hex_lower(payload)),
    }
}

fn map_to_wire(map: &Map<String, Value>) -> Result<Vec<u8>, WireCodecError> {
    let mut fields = Vec::with_capacity(map.len());
    for (key, value) in map {
        let field: u32 = key
            .parse()
            .map_err(|_| WireCodecError::InvalidFieldNumber(key.clone()))?;
        if !(1..=MAX_FIELD_NUMBER).contains(&field) {
            return Err(WireCodecError::InvalidFieldNumber(key.clone()));
        }
        fields.push((field, value));
    }
    fields.sort_by_key(|(field, _)| *field);

    let mut buf = Vec::new();
    for (field, value) in fields {
        match value {
            Value::String(text) => {
                encode_key(field, WireType::LengthDelimited, &mut buf);
                encode_varint(text.len() as u64, &mut buf);
                buf.extend_from_slice(text.as_bytes());
            }
            Value::Number(number) => match number_as_whole(number) {
                Some(whole) => {
                    encode_key(field, WireType::Varint, &mut buf);
                    encode_varint(whole, &mut buf);
                }
                None => {
                    let float = number.as_f64().unwrap_or(0.0);
                    encode_key(field, WireType::SixtyFourBit, &mut buf);
                    buf.extend_from_slice(&float.to_bits().to_le_bytes());
                }
            },
            Value::Bool(flag) => {
                encode_key(field, WireType::Varint, &mut buf);
                encode_varint(u64::from(*flag), &mut buf);
            }
            Value::Object(nested) => {
                let encoded = map_to_wire(nested)?;
                encode_key(field, WireType::LengthDelimited, &mut buf);
                encode_varint(encoded.len() as u64, &mut buf);
                buf.extend_from_slice(&encoded);
            }
            other => {
                return Err(WireCodecError::UnsupportedValue {
                    field,
                    kind: json_kind(other),
                });
            }
        }
    }
    Ok(buf)
}

/// Varint eligibility is decided by the numeric value, not the JSON literal:
/// `42` and `42.0` both encode as varint 42. A number qualifies when its
/// fractional part is zero and it lies in `[0, 2^63 - 1]`; everything else
/// is carried as the fixed64 IEEE-754 bit pattern.
fn number_as_whole(number: &serde_json::Number) -> Option<u64> {
    if let Some(unsigned) = number.as_u64() {
        return (unsigned <= i64::MAX as u64).then_some(unsigned);
    }
    let float = number.as_f64()?;
    (float.fract() == 0.0 && float >= 0.0 && float <= i64::MAX as f64).then(|| float as u64)
}

fn is_printable(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|byte| *byte >= 0x20 || matches!(byte, b'\n' | b'\r' | b'\t'))
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
