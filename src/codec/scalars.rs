//! Custom scalar registry.
//!
//! A custom scalar is a pseudo-scalar schema type backed by a single-field
//! wrapper message the codec reads and writes transparently. Schemas refer
//! to it by its lowercase name; callers see the user-facing value, never
//! the wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use num_bigint::BigUint;
use prost_reflect::Value as WireValue;
use serde_json::Value as Json;

use super::CodecError;

/// Width of the `bigint` wire representation in bytes.
const BIGINT_BYTES: usize = 32;

/// Wire representation used by a custom scalar's wrapper field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// Variable-length bytes.
    Bytes,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// UTF-8 string.
    String,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// IEEE-754 double.
    Double,
}

impl WireKind {
    /// Protobuf scalar type spelled into the wrapper message definition.
    pub(crate) fn proto_type(self) -> &'static str {
        match self {
            WireKind::Bytes => "bytes",
            WireKind::Int64 => "int64",
            WireKind::Uint64 => "uint64",
            WireKind::String => "string",
            WireKind::Int32 => "int32",
            WireKind::Uint32 => "uint32",
            WireKind::Double => "double",
        }
    }
}

/// Converts a user-facing value into its wire representation.
pub type ScalarEncodeFn = Arc<dyn Fn(&Json) -> Result<WireValue, CodecError> + Send + Sync>;
/// Converts a wire value back into the user-facing representation.
pub type ScalarDecodeFn = Arc<dyn Fn(&WireValue) -> Result<Json, CodecError> + Send + Sync>;

/// A registered custom scalar.
#[derive(Clone)]
pub struct ScalarDescriptor {
    pub name: String,
    pub wire: WireKind,
    pub encode: ScalarEncodeFn,
    pub decode: ScalarDecodeFn,
}

impl ScalarDescriptor {
    /// Create a descriptor. Names must be lowercase, that is how schemas
    /// reference them.
    pub fn new(
        name: impl Into<String>,
        wire: WireKind,
        encode: ScalarEncodeFn,
        decode: ScalarDecodeFn,
    ) -> Result<Self, CodecError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(CodecError::InvalidScalar(format!(
                "scalar name '{}' must be non-empty lowercase",
                name
            )));
        }
        Ok(Self {
            name,
            wire,
            encode,
            decode,
        })
    }

    /// Schema source of the wrapper message installed for this scalar.
    pub(crate) fn wrapper_source(&self) -> String {
        format!(
            "syntax = \"proto3\";\nmessage {} {{\n  {} value = 1;\n}}\n",
            self.name,
            self.wire.proto_type()
        )
    }

    /// Synthetic file name the wrapper is registered under.
    pub(crate) fn wrapper_file(&self) -> String {
        format!("protobus/scalar/{}.proto", self.name)
    }
}

impl std::fmt::Debug for ScalarDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarDescriptor")
            .field("name", &self.name)
            .field("wire", &self.wire)
            .finish()
    }
}

/// Name-indexed registry of custom scalars.
///
/// Wrapper messages are top-level and package-less, so the lowercase name
/// doubles as the wrapper's full message name.
#[derive(Default)]
pub(crate) struct ScalarRegistry {
    scalars: HashMap<String, ScalarDescriptor>,
}

impl ScalarRegistry {
    pub(crate) fn insert(&mut self, descriptor: ScalarDescriptor) -> Result<(), CodecError> {
        if self.scalars.contains_key(&descriptor.name) {
            return Err(CodecError::DuplicateScalar(descriptor.name));
        }
        self.scalars.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub(crate) fn get(&self, message_name: &str) -> Option<&ScalarDescriptor> {
        self.scalars.get(message_name)
    }

    /// Synthetic wrapper file names of every registered scalar.
    pub(crate) fn wrapper_files(&self) -> Vec<String> {
        self.scalars.values().map(|s| s.wrapper_file()).collect()
    }
}

/// The built-in scalars every codec starts with.
pub(crate) fn builtin_scalars() -> Vec<ScalarDescriptor> {
    vec![bigint_scalar(), timestamp_scalar()]
}

/// `bigint`: a 32-byte big-endian unsigned integer.
///
/// Accepts native unsigned integers, decimal strings, and `0x`-prefixed
/// hex strings. Zero and the empty string encode as 32 zero bytes. Decodes
/// to a JSON number when the value fits `u64`, a decimal string otherwise.
fn bigint_scalar() -> ScalarDescriptor {
    let encode: ScalarEncodeFn = Arc::new(|value| {
        let n = parse_biguint(value)?;
        let raw = n.to_bytes_be();
        if raw.len() > BIGINT_BYTES {
            return Err(CodecError::InvalidScalar(format!(
                "bigint value needs {} bytes, maximum is {}",
                raw.len(),
                BIGINT_BYTES
            )));
        }
        let mut buf = vec![0u8; BIGINT_BYTES - raw.len()];
        buf.extend_from_slice(&raw);
        Ok(WireValue::Bytes(bytes::Bytes::from(buf)))
    });

    let decode: ScalarDecodeFn = Arc::new(|value| {
        let bytes = value
            .as_bytes()
            .ok_or_else(|| CodecError::InvalidScalar("bigint wrapper holds no bytes".into()))?;
        let n = BigUint::from_bytes_be(bytes);
        let digits = n.to_u64_digits();
        match digits.len() {
            0 => Ok(Json::from(0u64)),
            1 => Ok(Json::from(digits[0])),
            _ => Ok(Json::String(n.to_str_radix(10))),
        }
    });

    // Name and wire kind are fixed, construction cannot fail.
    ScalarDescriptor {
        name: "bigint".to_string(),
        wire: WireKind::Bytes,
        encode,
        decode,
    }
}

fn parse_biguint(value: &Json) -> Result<BigUint, CodecError> {
    match value {
        Json::Number(n) => n
            .as_u64()
            .map(BigUint::from)
            .ok_or_else(|| CodecError::InvalidScalar(format!("bigint rejects {}", n))),
        Json::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(BigUint::from(0u32));
            }
            let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => (hex, 16),
                None => (s, 10),
            };
            BigUint::parse_bytes(digits.as_bytes(), radix)
                .ok_or_else(|| CodecError::InvalidScalar(format!("bigint rejects '{}'", s)))
        }
        other => Err(CodecError::InvalidScalar(format!(
            "bigint expects integer or string, got {}",
            json_kind(other)
        ))),
    }
}

/// `timestamp`: signed 64-bit milliseconds since the Unix epoch.
///
/// Accepts ISO-8601 strings and numeric milliseconds; decodes to an
/// ISO-8601 UTC string with millisecond precision.
fn timestamp_scalar() -> ScalarDescriptor {
    let encode: ScalarEncodeFn = Arc::new(|value| {
        let millis = match value {
            Json::Number(n) => n
                .as_i64()
                .ok_or_else(|| CodecError::InvalidScalar(format!("timestamp rejects {}", n)))?,
            Json::String(s) => DateTime::parse_from_rfc3339(s)
                .map_err(|e| CodecError::InvalidScalar(format!("timestamp rejects '{}': {}", s, e)))?
                .timestamp_millis(),
            other => {
                return Err(CodecError::InvalidScalar(format!(
                    "timestamp expects date string or milliseconds, got {}",
                    json_kind(other)
                )))
            }
        };
        Ok(WireValue::I64(millis))
    });

    let decode: ScalarDecodeFn = Arc::new(|value| {
        let millis = value
            .as_i64()
            .ok_or_else(|| CodecError::InvalidScalar("timestamp wrapper holds no int64".into()))?;
        let date = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| CodecError::InvalidScalar(format!("timestamp {} out of range", millis)))?;
        Ok(Json::String(
            date.to_rfc3339_opts(SecondsFormat::Millis, true),
        ))
    });

    ScalarDescriptor {
        name: "timestamp".to_string(),
        wire: WireKind::Int64,
        encode,
        decode,
    }
}

pub(crate) fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_bigint(value: &Json) -> Vec<u8> {
        let scalar = bigint_scalar();
        match (scalar.encode)(value).unwrap() {
            WireValue::Bytes(b) => b.to_vec(),
            other => panic!("unexpected wire value {:?}", other),
        }
    }

    fn decode_bigint(raw: &[u8]) -> Json {
        let scalar = bigint_scalar();
        (scalar.decode)(&WireValue::Bytes(bytes::Bytes::copy_from_slice(raw))).unwrap()
    }

    #[test]
    fn test_bigint_zero_and_empty() {
        assert_eq!(encode_bigint(&Json::from(0u64)), vec![0u8; 32]);
        assert_eq!(encode_bigint(&Json::String(String::new())), vec![0u8; 32]);
        assert_eq!(decode_bigint(&[0u8; 32]), Json::from(0u64));
    }

    #[test]
    fn test_bigint_max_value() {
        let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let raw = encode_bigint(&Json::String(max.to_string()));
        assert_eq!(raw, vec![0xffu8; 32]);
        assert_eq!(decode_bigint(&raw), Json::String(max.to_string()));
    }

    #[test]
    fn test_bigint_hex_round_trip() {
        let raw = encode_bigint(&Json::String("0xdeadbeef".to_string()));
        let mut expected = vec![0u8; 28];
        expected.extend_from_slice(&hex::decode("deadbeef").unwrap());
        assert_eq!(raw, expected);
        assert_eq!(decode_bigint(&raw), Json::from(0xdeadbeefu64));
    }

    #[test]
    fn test_bigint_rejects_overflow_and_negatives() {
        let scalar = bigint_scalar();
        // 2^256 takes 33 bytes.
        let over = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!((scalar.encode)(&Json::String(over.to_string())).is_err());
        assert!((scalar.encode)(&Json::from(-1i64)).is_err());
        assert!((scalar.encode)(&Json::Bool(true)).is_err());
    }

    #[test]
    fn test_timestamp_iso_round_trip() {
        let scalar = timestamp_scalar();
        let encoded = (scalar.encode)(&Json::String("2024-05-01T12:30:00.250Z".to_string())).unwrap();
        let millis = encoded.as_i64().unwrap();
        let decoded = (scalar.decode)(&WireValue::I64(millis)).unwrap();
        assert_eq!(decoded, Json::String("2024-05-01T12:30:00.250Z".to_string()));
    }

    #[test]
    fn test_timestamp_numeric_input() {
        let scalar = timestamp_scalar();
        let encoded = (scalar.encode)(&Json::from(0i64)).unwrap();
        assert_eq!(encoded.as_i64(), Some(0));
        let decoded = (scalar.decode)(&WireValue::I64(0)).unwrap();
        assert_eq!(decoded, Json::String("1970-01-01T00:00:00.000Z".to_string()));
    }

    #[test]
    fn test_wrapper_source_shape() {
        let scalar = bigint_scalar();
        let source = scalar.wrapper_source();
        assert!(source.contains("message bigint"));
        assert!(source.contains("bytes value = 1;"));
        assert_eq!(scalar.wrapper_file(), "protobus/scalar/bigint.proto");
    }

    #[test]
    fn test_descriptor_rejects_uppercase_names() {
        let noop_encode: ScalarEncodeFn = Arc::new(|_| Ok(WireValue::I32(0)));
        let noop_decode: ScalarDecodeFn = Arc::new(|_| Ok(Json::Null));
        assert!(ScalarDescriptor::new("BigInt", WireKind::Int32, noop_encode, noop_decode).is_err());
    }
}
