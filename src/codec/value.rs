//! Conversion between JSON records and dynamic Protobuf messages.
//!
//! Encoding walks the target descriptor and rejects unknown fields;
//! decoding renders every declared field, emitting `null` for absent
//! fields that track presence. Custom scalar wrappers are intercepted in
//! both directions so callers only ever see the user-facing value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage,
    Value as WireValue,
};
use serde_json::{Map, Number, Value as Json};

use super::scalars::{json_kind, ScalarRegistry};
use super::CodecError;

/// Largest integer magnitude losslessly representable as a JSON number.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Build a dynamic message of type `desc` from a JSON object.
pub(crate) fn message_from_json(
    desc: &MessageDescriptor,
    json: &Json,
    scalars: &ScalarRegistry,
) -> Result<DynamicMessage, CodecError> {
    let object = json.as_object().ok_or_else(|| {
        CodecError::InvalidPayload(format!(
            "{} expects an object, got {}",
            desc.full_name(),
            json_kind(json)
        ))
    })?;

    let mut message = DynamicMessage::new(desc.clone());
    for (key, value) in object {
        if value.is_null() {
            continue;
        }
        let field = desc.get_field_by_name(key).ok_or_else(|| CodecError::UnknownField {
            message: desc.full_name().to_string(),
            field: key.clone(),
        })?;
        let wire = field_from_json(&field, value, scalars)?;
        message.set_field(&field, wire);
    }
    Ok(message)
}

/// Render a dynamic message as a JSON object.
///
/// Fields that track presence (message fields, optionals, oneof members)
/// render as `null` when absent; all other fields render their value,
/// default or not.
pub(crate) fn message_to_json(
    message: &DynamicMessage,
    scalars: &ScalarRegistry,
) -> Result<Json, CodecError> {
    let desc = message.descriptor();
    let mut object = Map::new();
    for field in desc.fields() {
        if field.supports_presence() && !message.has_field(&field) {
            object.insert(field.name().to_string(), Json::Null);
            continue;
        }
        let value = message.get_field(&field);
        object.insert(
            field.name().to_string(),
            field_to_json(&field, &value, scalars)?,
        );
    }
    Ok(Json::Object(object))
}

fn field_from_json(
    field: &FieldDescriptor,
    json: &Json,
    scalars: &ScalarRegistry,
) -> Result<WireValue, CodecError> {
    if field.is_map() {
        return map_from_json(field, json, scalars);
    }
    if field.is_list() {
        let items = json.as_array().ok_or_else(|| {
            invalid(field, "array", json)
        })?;
        let converted = items
            .iter()
            .map(|item| single_from_json(field, &field.kind(), item, scalars))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(WireValue::List(converted));
    }
    single_from_json(field, &field.kind(), json, scalars)
}

fn map_from_json(
    field: &FieldDescriptor,
    json: &Json,
    scalars: &ScalarRegistry,
) -> Result<WireValue, CodecError> {
    let Kind::Message(entry) = field.kind() else {
        return Err(CodecError::InvalidPayload(format!(
            "map field {} has no entry type",
            field.name()
        )));
    };
    let key_field = entry.map_entry_key_field();
    let value_field = entry.map_entry_value_field();

    let object = json.as_object().ok_or_else(|| invalid(field, "object", json))?;
    let mut map = std::collections::HashMap::new();
    for (key, value) in object {
        let map_key = map_key_from_str(&key_field, key)?;
        let wire = single_from_json(field, &value_field.kind(), value, scalars)?;
        map.insert(map_key, wire);
    }
    Ok(WireValue::Map(map))
}

fn map_key_from_str(key_field: &FieldDescriptor, raw: &str) -> Result<MapKey, CodecError> {
    let parse_err = || {
        CodecError::InvalidPayload(format!(
            "map key '{}' does not fit {:?}",
            raw,
            key_field.kind()
        ))
    };
    match key_field.kind() {
        Kind::String => Ok(MapKey::String(raw.to_string())),
        Kind::Bool => match raw {
            "true" => Ok(MapKey::Bool(true)),
            "false" => Ok(MapKey::Bool(false)),
            _ => Err(parse_err()),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            raw.parse::<i32>().map(MapKey::I32).map_err(|_| parse_err())
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            raw.parse::<i64>().map(MapKey::I64).map_err(|_| parse_err())
        }
        Kind::Uint32 | Kind::Fixed32 => {
            raw.parse::<u32>().map(MapKey::U32).map_err(|_| parse_err())
        }
        Kind::Uint64 | Kind::Fixed64 => {
            raw.parse::<u64>().map(MapKey::U64).map_err(|_| parse_err())
        }
        other => Err(CodecError::InvalidPayload(format!(
            "unsupported map key kind {:?}",
            other
        ))),
    }
}

fn single_from_json(
    field: &FieldDescriptor,
    kind: &Kind,
    json: &Json,
    scalars: &ScalarRegistry,
) -> Result<WireValue, CodecError> {
    match kind {
        Kind::Message(inner) => {
            if let Some(scalar) = scalars.get(inner.full_name()) {
                let mut wrapper = DynamicMessage::new(inner.clone());
                wrapper.set_field_by_number(1, (scalar.encode)(json)?);
                return Ok(WireValue::Message(wrapper));
            }
            Ok(WireValue::Message(message_from_json(inner, json, scalars)?))
        }
        Kind::Double => Ok(WireValue::F64(float_from_json(field, json)?)),
        Kind::Float => Ok(WireValue::F32(float_from_json(field, json)? as f32)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let n = int_from_json(field, json)?;
            i32::try_from(n)
                .map(WireValue::I32)
                .map_err(|_| invalid(field, "int32", json))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Ok(WireValue::I64(int_from_json(field, json)?))
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = uint_from_json(field, json)?;
            u32::try_from(n)
                .map(WireValue::U32)
                .map_err(|_| invalid(field, "uint32", json))
        }
        Kind::Uint64 | Kind::Fixed64 => Ok(WireValue::U64(uint_from_json(field, json)?)),
        Kind::Bool => json
            .as_bool()
            .map(WireValue::Bool)
            .ok_or_else(|| invalid(field, "bool", json)),
        Kind::String => json
            .as_str()
            .map(|s| WireValue::String(s.to_string()))
            .ok_or_else(|| invalid(field, "string", json)),
        Kind::Bytes => {
            let encoded = json.as_str().ok_or_else(|| invalid(field, "base64 string", json))?;
            let raw = BASE64
                .decode(encoded)
                .map_err(|_| invalid(field, "base64 string", json))?;
            Ok(WireValue::Bytes(bytes::Bytes::from(raw)))
        }
        Kind::Enum(desc) => match json {
            Json::String(name) => desc
                .get_value_by_name(name)
                .map(|v| WireValue::EnumNumber(v.number()))
                .ok_or_else(|| {
                    CodecError::InvalidPayload(format!(
                        "'{}' is not a value of enum {}",
                        name,
                        desc.full_name()
                    ))
                }),
            Json::Number(n) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(WireValue::EnumNumber)
                .ok_or_else(|| invalid(field, "enum number", json)),
            _ => Err(invalid(field, "enum name or number", json)),
        },
    }
}

fn float_from_json(field: &FieldDescriptor, json: &Json) -> Result<f64, CodecError> {
    json.as_f64().ok_or_else(|| invalid(field, "number", json))
}

/// Signed 64-bit values accept numbers and decimal strings.
fn int_from_json(field: &FieldDescriptor, json: &Json) -> Result<i64, CodecError> {
    match json {
        Json::Number(n) => n.as_i64().ok_or_else(|| invalid(field, "integer", json)),
        Json::String(s) => s.parse::<i64>().map_err(|_| invalid(field, "integer", json)),
        _ => Err(invalid(field, "integer", json)),
    }
}

fn uint_from_json(field: &FieldDescriptor, json: &Json) -> Result<u64, CodecError> {
    match json {
        Json::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(field, "unsigned integer", json)),
        Json::String(s) => s
            .parse::<u64>()
            .map_err(|_| invalid(field, "unsigned integer", json)),
        _ => Err(invalid(field, "unsigned integer", json)),
    }
}

fn invalid(field: &FieldDescriptor, expected: &str, got: &Json) -> CodecError {
    CodecError::InvalidPayload(format!(
        "field {} expects {}, got {}",
        field.full_name(),
        expected,
        json_kind(got)
    ))
}

fn field_to_json(
    field: &FieldDescriptor,
    value: &WireValue,
    scalars: &ScalarRegistry,
) -> Result<Json, CodecError> {
    match value {
        WireValue::List(items) => {
            let rendered = items
                .iter()
                .map(|item| single_to_json(field, item, scalars))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Json::Array(rendered))
        }
        WireValue::Map(entries) => {
            let mut object = Map::new();
            for (key, entry) in entries {
                object.insert(map_key_to_string(key), single_to_json(field, entry, scalars)?);
            }
            Ok(Json::Object(object))
        }
        single => single_to_json(field, single, scalars),
    }
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(v) => v.to_string(),
        MapKey::I32(v) => v.to_string(),
        MapKey::I64(v) => v.to_string(),
        MapKey::U32(v) => v.to_string(),
        MapKey::U64(v) => v.to_string(),
        MapKey::String(v) => v.clone(),
    }
}

fn single_to_json(
    field: &FieldDescriptor,
    value: &WireValue,
    scalars: &ScalarRegistry,
) -> Result<Json, CodecError> {
    match value {
        WireValue::Message(inner) => {
            let desc = inner.descriptor();
            if let Some(scalar) = scalars.get(desc.full_name()) {
                let wrapped = inner.get_field_by_number(1).ok_or_else(|| {
                    CodecError::InvalidScalar(format!("{} wrapper has no value field", scalar.name))
                })?;
                return (scalar.decode)(wrapped.as_ref());
            }
            message_to_json(inner, scalars)
        }
        WireValue::Bool(v) => Ok(Json::Bool(*v)),
        WireValue::I32(v) => Ok(Json::from(*v)),
        WireValue::U32(v) => Ok(Json::from(*v)),
        WireValue::I64(v) => {
            if v.unsigned_abs() <= MAX_SAFE_INTEGER {
                Ok(Json::from(*v))
            } else {
                Ok(Json::String(v.to_string()))
            }
        }
        WireValue::U64(v) => {
            if *v <= MAX_SAFE_INTEGER {
                Ok(Json::from(*v))
            } else {
                Ok(Json::String(v.to_string()))
            }
        }
        WireValue::F32(v) => Number::from_f64(f64::from(*v))
            .map(Json::Number)
            .ok_or_else(|| non_finite(field)),
        WireValue::F64(v) => Number::from_f64(*v)
            .map(Json::Number)
            .ok_or_else(|| non_finite(field)),
        WireValue::String(v) => Ok(Json::String(v.clone())),
        WireValue::Bytes(v) => Ok(Json::String(BASE64.encode(v))),
        WireValue::EnumNumber(n) => {
            if let Kind::Enum(desc) = field.kind() {
                if let Some(value) = desc.get_value(*n) {
                    return Ok(Json::String(value.name().to_string()));
                }
            }
            Ok(Json::from(*n))
        }
        WireValue::List(_) | WireValue::Map(_) => Err(CodecError::InvalidPayload(format!(
            "nested repeated value on field {}",
            field.name()
        ))),
    }
}

fn non_finite(field: &FieldDescriptor) -> CodecError {
    CodecError::InvalidPayload(format!(
        "field {} holds a non-finite float",
        field.name()
    ))
}
