//! Schema registry and Protobuf codec.
//!
//! The codec owns a process-wide descriptor pool built from `.proto`
//! sources discovered at startup or parsed at runtime, plus the custom
//! scalar registry. It encodes and decodes the three framing envelopes
//! (request, response, event) and renders language-neutral type views for
//! code generators.
//!
//! Custom scalars keep their registry on the codec instance. Register them
//! before parsing schemas that reference them.

mod containers;
mod scalars;
mod type_view;
mod value;

use std::path::Path;
use std::sync::RwLock;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor};
use prost_types::FileDescriptorProto;
use serde_json::Value as Json;
use tracing::{debug, info};
use walkdir::WalkDir;

pub use containers::{
    response_container, EventContainer, RequestContainer, ResponseContainer, ResponseError,
    ResponseResult,
};
pub use scalars::{ScalarDecodeFn, ScalarDescriptor, ScalarEncodeFn, WireKind};
pub use type_view::{EnumValueView, EnumView, FieldView, MessageView, MethodView, ServiceView};

use crate::error::ServiceError;
use scalars::{builtin_scalars, ScalarRegistry};
use value::{message_from_json, message_to_json};

/// Errors raised by schema handling and payload conversion.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to parse schema {name}: {message}")]
    Parse { name: String, message: String },

    #[error("unresolved schema dependencies: {0}")]
    UnresolvedDependency(String),

    #[error("descriptor error: {0}")]
    Descriptor(String),

    #[error("unknown type {0}")]
    UnknownType(String),

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("unknown field {field} on {message}")]
    UnknownField { message: String, field: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid scalar value: {0}")]
    InvalidScalar(String),

    #[error("duplicate scalar {0}")]
    DuplicateScalar(String),

    #[error("decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("schema io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded RPC request.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    /// Fully qualified method, `Package.Service.method`.
    pub method: String,
    pub actor: String,
    pub payload: Json,
}

/// A decoded RPC reply: either the method result or a structured error.
#[derive(Debug, Clone)]
pub enum DecodedResponse {
    Result(Json),
    Error(ServiceError),
}

/// A decoded event.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub event_type: String,
    pub topic: String,
    pub payload: Json,
}

struct CodecInner {
    pool: DescriptorPool,
    scalars: ScalarRegistry,
    inline_files: u64,
}

/// Message factory: schema registry, scalar registry, and envelope codec.
pub struct Codec {
    inner: RwLock<CodecInner>,
}

impl Codec {
    /// Create a codec with the built-in `bigint` and `timestamp` scalars
    /// installed.
    pub fn new() -> Result<Self, CodecError> {
        let mut inner = CodecInner {
            pool: DescriptorPool::new(),
            scalars: ScalarRegistry::default(),
            inline_files: 0,
        };
        for scalar in builtin_scalars() {
            install_scalar(&mut inner, scalar)?;
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Register a custom scalar.
    ///
    /// The scalar's wrapper message becomes resolvable immediately, so
    /// registration may happen before or after [`Codec::init`]; schemas
    /// referencing the scalar must be parsed after it is registered.
    pub fn register_scalar(&self, descriptor: ScalarDescriptor) -> Result<(), CodecError> {
        let mut inner = self.write();
        install_scalar(&mut inner, descriptor)
    }

    /// Discover `.proto` files under each directory recursively and parse
    /// them into the registry.
    pub fn init(&self, schema_dirs: &[impl AsRef<Path>]) -> Result<(), CodecError> {
        let mut sources = Vec::new();
        for dir in schema_dirs {
            let dir = dir.as_ref();
            for entry in WalkDir::new(dir).follow_links(true) {
                let entry = entry.map_err(|e| CodecError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.path().extension().and_then(|e| e.to_str()) != Some("proto") {
                    continue;
                }
                let name = entry
                    .path()
                    .strip_prefix(dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let text = std::fs::read_to_string(entry.path())?;
                sources.push((name, text));
            }
        }

        let mut inner = self.write();
        let parsed = sources
            .iter()
            .map(|(name, text)| parse_user_schema(&inner.scalars, name, text))
            .collect::<Result<Vec<_>, _>>()?;
        let count = parsed.len();
        add_in_dependency_order(&mut inner.pool, parsed)?;
        info!(files = count, "schema registry initialized");
        Ok(())
    }

    /// Parse one schema text block into the registry.
    ///
    /// Texts without a `syntax` declaration are treated as proto3. Types
    /// the text imports must already be registered.
    pub fn parse(&self, text: &str) -> Result<(), CodecError> {
        let mut inner = self.write();
        inner.inline_files += 1;
        let name = format!("inline/{}.proto", inner.inline_files);
        let file = parse_user_schema(&inner.scalars, &name, text)?;
        inner
            .pool
            .add_file_descriptor_proto(file)
            .map_err(|e| CodecError::Descriptor(e.to_string()))?;
        debug!(schema = %name, "parsed inline schema");
        Ok(())
    }

    /// Encode an RPC request envelope.
    ///
    /// `method` is fully qualified; the payload is validated against the
    /// method's input type, rejecting unknown fields.
    pub fn encode_request(
        &self,
        method: &str,
        payload: &Json,
        actor: &str,
    ) -> Result<Vec<u8>, CodecError> {
        let inner = self.read();
        let descriptor = method_descriptor(&inner.pool, method)?;
        let message = message_from_json(&descriptor.input(), payload, &inner.scalars)?;
        let container = RequestContainer {
            method: method.to_string(),
            actor: actor.to_string(),
            payload: message.encode_to_vec(),
        };
        Ok(container.encode_to_vec())
    }

    /// Decode an RPC request envelope. The inner payload is decoded in the
    /// same pass, exactly once.
    pub fn decode_request(&self, bytes: &[u8]) -> Result<DecodedRequest, CodecError> {
        let container = RequestContainer::decode(bytes)?;
        let inner = self.read();
        let descriptor = method_descriptor(&inner.pool, &container.method)?;
        let message = DynamicMessage::decode(descriptor.input(), container.payload.as_slice())?;
        let payload = message_to_json(&message, &inner.scalars)?;
        Ok(DecodedRequest {
            method: container.method,
            actor: container.actor,
            payload,
        })
    }

    /// Encode a successful RPC reply against the method's output type.
    pub fn encode_response(&self, method: &str, payload: &Json) -> Result<Vec<u8>, CodecError> {
        let inner = self.read();
        let descriptor = method_descriptor(&inner.pool, method)?;
        let message = message_from_json(&descriptor.output(), payload, &inner.scalars)?;
        let container = ResponseContainer {
            outcome: Some(response_container::Outcome::Result(ResponseResult {
                payload: message.encode_to_vec(),
            })),
        };
        Ok(container.encode_to_vec())
    }

    /// Encode a structured error reply.
    pub fn encode_error(&self, error: &ServiceError) -> Vec<u8> {
        let container = ResponseContainer {
            outcome: Some(response_container::Outcome::Error(ResponseError {
                message: error.message.clone(),
                code: error.code.clone(),
                handled: error.handled,
            })),
        };
        container.encode_to_vec()
    }

    /// Decode an RPC reply for `method`.
    pub fn decode_response(
        &self,
        method: &str,
        bytes: &[u8],
    ) -> Result<DecodedResponse, CodecError> {
        let container = ResponseContainer::decode(bytes)?;
        match container.outcome {
            Some(response_container::Outcome::Result(result)) => {
                let inner = self.read();
                let descriptor = method_descriptor(&inner.pool, method)?;
                let message =
                    DynamicMessage::decode(descriptor.output(), result.payload.as_slice())?;
                Ok(DecodedResponse::Result(message_to_json(
                    &message,
                    &inner.scalars,
                )?))
            }
            Some(response_container::Outcome::Error(error)) => {
                Ok(DecodedResponse::Error(ServiceError {
                    message: error.message,
                    code: error.code,
                    handled: error.handled,
                }))
            }
            None => Err(CodecError::InvalidPayload(
                "response container holds neither result nor error".to_string(),
            )),
        }
    }

    /// Encode an event envelope. The payload is validated against the
    /// event type.
    pub fn encode_event(
        &self,
        event_type: &str,
        payload: &Json,
        topic: &str,
    ) -> Result<Vec<u8>, CodecError> {
        let inner = self.read();
        let descriptor = inner
            .pool
            .get_message_by_name(event_type)
            .ok_or_else(|| CodecError::UnknownType(event_type.to_string()))?;
        let message = message_from_json(&descriptor, payload, &inner.scalars)?;
        let container = EventContainer {
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            payload: message.encode_to_vec(),
        };
        Ok(container.encode_to_vec())
    }

    /// Decode an event envelope.
    pub fn decode_event(&self, bytes: &[u8]) -> Result<DecodedEvent, CodecError> {
        let container = EventContainer::decode(bytes)?;
        let inner = self.read();
        let descriptor = inner
            .pool
            .get_message_by_name(&container.event_type)
            .ok_or_else(|| CodecError::UnknownType(container.event_type.clone()))?;
        let message = DynamicMessage::decode(descriptor, container.payload.as_slice())?;
        let payload = message_to_json(&message, &inner.scalars)?;
        Ok(DecodedEvent {
            event_type: container.event_type,
            topic: container.topic,
            payload,
        })
    }

    /// Render a language-neutral description of a service and every type
    /// reachable from its methods.
    pub fn export_type_view(&self, service: &str) -> Result<ServiceView, CodecError> {
        let inner = self.read();
        let descriptor = inner
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| CodecError::UnknownService(service.to_string()))?;
        Ok(type_view::render_service(&descriptor, &inner.scalars))
    }

    /// Names of the methods a service declares, in declaration order.
    pub fn service_methods(&self, service: &str) -> Result<Vec<String>, CodecError> {
        let inner = self.read();
        let descriptor = inner
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| CodecError::UnknownService(service.to_string()))?;
        Ok(descriptor.methods().map(|m| m.name().to_string()).collect())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CodecInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CodecInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn install_scalar(inner: &mut CodecInner, descriptor: ScalarDescriptor) -> Result<(), CodecError> {
    let file = parse_schema(&descriptor.wrapper_file(), &descriptor.wrapper_source())?;
    inner
        .pool
        .add_file_descriptor_proto(file)
        .map_err(|e| CodecError::Descriptor(e.to_string()))?;
    debug!(scalar = %descriptor.name, wire = ?descriptor.wire, "registered custom scalar");
    inner.scalars.insert(descriptor)
}

fn parse_schema(name: &str, text: &str) -> Result<FileDescriptorProto, CodecError> {
    let source = if text.contains("syntax") {
        text.to_string()
    } else {
        format!("syntax = \"proto3\";\n{}", text)
    };
    protox_parse::parse(name, &source).map_err(|e| CodecError::Parse {
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Parse a user schema and make every registered scalar wrapper visible to
/// it. Schemas reference custom scalars by bare name without importing the
/// synthetic wrapper files, so the dependency is injected here.
fn parse_user_schema(
    scalars: &ScalarRegistry,
    name: &str,
    text: &str,
) -> Result<FileDescriptorProto, CodecError> {
    let mut file = parse_schema(name, text)?;
    for wrapper in scalars.wrapper_files() {
        if !file.dependency.iter().any(|d| d == &wrapper) {
            file.dependency.push(wrapper);
        }
    }
    Ok(file)
}

/// Add parsed files to the pool, deferring files whose imports have not
/// landed yet.
fn add_in_dependency_order(
    pool: &mut DescriptorPool,
    mut files: Vec<FileDescriptorProto>,
) -> Result<(), CodecError> {
    while !files.is_empty() {
        let before = files.len();
        let mut deferred = Vec::new();
        let mut last_error = None;
        for file in files {
            match pool.add_file_descriptor_proto(file.clone()) {
                Ok(_) => {}
                Err(e) => {
                    last_error = Some(e.to_string());
                    deferred.push(file);
                }
            }
        }
        if deferred.len() == before {
            let names: Vec<String> = deferred
                .iter()
                .map(|f| f.name().to_string())
                .collect();
            return Err(CodecError::UnresolvedDependency(format!(
                "{} ({})",
                names.join(", "),
                last_error.unwrap_or_default()
            )));
        }
        files = deferred;
    }
    Ok(())
}

fn method_descriptor(pool: &DescriptorPool, method: &str) -> Result<MethodDescriptor, CodecError> {
    let (service_name, method_name) = method
        .rsplit_once('.')
        .ok_or_else(|| CodecError::UnknownMethod(method.to_string()))?;
    let service = pool
        .get_service_by_name(service_name)
        .ok_or_else(|| CodecError::UnknownService(service_name.to_string()))?;
    let result = service
        .methods()
        .find(|m| m.name() == method_name)
        .ok_or_else(|| CodecError::UnknownMethod(method.to_string()));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MATH_SCHEMA: &str = r#"
        service Math {
          rpc add(AddRequest) returns (AddResponse);
        }
        message AddRequest {
          int32 a = 1;
          int32 b = 2;
        }
        message AddResponse {
          int32 result = 1;
        }
    "#;

    fn codec_with_math() -> Codec {
        let codec = Codec::new().unwrap();
        codec.parse(MATH_SCHEMA).unwrap();
        codec
    }

    #[test]
    fn test_request_round_trip() {
        let codec = codec_with_math();
        let bytes = codec
            .encode_request("Math.add", &json!({"a": 1, "b": 2}), "tester")
            .unwrap();
        let decoded = codec.decode_request(&bytes).unwrap();
        assert_eq!(decoded.method, "Math.add");
        assert_eq!(decoded.actor, "tester");
        assert_eq!(decoded.payload, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_response_round_trip() {
        let codec = codec_with_math();
        let bytes = codec
            .encode_response("Math.add", &json!({"result": 3}))
            .unwrap();
        match codec.decode_response("Math.add", &bytes).unwrap() {
            DecodedResponse::Result(data) => assert_eq!(data, json!({"result": 3})),
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let codec = codec_with_math();
        let error = ServiceError::handled("VALIDATION_ERROR", "bad");
        let bytes = codec.encode_error(&error);
        match codec.decode_response("Math.add", &bytes).unwrap() {
            DecodedResponse::Error(e) => {
                assert_eq!(e.code, "VALIDATION_ERROR");
                assert!(e.handled);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let codec = codec_with_math();
        let err = codec
            .encode_request("Math.add", &json!({"a": 1, "nope": 2}), "")
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownField { .. }));
    }

    #[test]
    fn test_unknown_method() {
        let codec = codec_with_math();
        let err = codec
            .encode_request("Math.subtract", &json!({}), "")
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownMethod(_)));
        let err = codec.encode_request("add", &json!({}), "").unwrap_err();
        assert!(matches!(err, CodecError::UnknownMethod(_)));
    }

    #[test]
    fn test_event_round_trip() {
        let codec = Codec::new().unwrap();
        codec
            .parse("message UserCreated { string id = 1; uint64 at = 2; }")
            .unwrap();
        let bytes = codec
            .encode_event(
                "UserCreated",
                &json!({"id": "u-1", "at": 42}),
                "EVENT.UserCreated",
            )
            .unwrap();
        let decoded = codec.decode_event(&bytes).unwrap();
        assert_eq!(decoded.event_type, "UserCreated");
        assert_eq!(decoded.topic, "EVENT.UserCreated");
        assert_eq!(decoded.payload, json!({"id": "u-1", "at": 42}));
    }

    #[test]
    fn test_custom_scalar_field() {
        let codec = Codec::new().unwrap();
        codec
            .parse(
                "message Transfer { bigint amount = 1; timestamp at = 2; string memo = 3; }\n\
                 service Ledger { rpc transfer(Transfer) returns (Transfer); }",
            )
            .unwrap();

        let payload = json!({
            "amount": "0xdeadbeef",
            "at": "2024-05-01T12:30:00.000Z",
            "memo": "rent"
        });
        let bytes = codec
            .encode_request("Ledger.transfer", &payload, "")
            .unwrap();
        let decoded = codec.decode_request(&bytes).unwrap();
        assert_eq!(decoded.payload["amount"], json!(0xdeadbeefu64));
        assert_eq!(decoded.payload["at"], json!("2024-05-01T12:30:00.000Z"));
        assert_eq!(decoded.payload["memo"], json!("rent"));
    }

    #[test]
    fn test_huge_bigint_survives_round_trip() {
        let codec = Codec::new().unwrap();
        codec.parse("message Burn { bigint amount = 1; }").unwrap();
        let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let bytes = codec
            .encode_event("Burn", &json!({ "amount": max }), "EVENT.Burn")
            .unwrap();
        let decoded = codec.decode_event(&bytes).unwrap();
        assert_eq!(decoded.payload["amount"], json!(max));
    }

    #[test]
    fn test_schema_dir_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(
            nested.join("ping.proto"),
            "syntax = \"proto3\";\nmessage Ping { string id = 1; }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let codec = Codec::new().unwrap();
        codec.init(&[dir.path()]).unwrap();
        codec
            .encode_event("Ping", &json!({"id": "x"}), "EVENT.Ping")
            .unwrap();
    }

    #[test]
    fn test_init_resolves_imports_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        // "a_user.proto" sorts before the file it imports.
        std::fs::write(
            dir.path().join("a_user.proto"),
            "syntax = \"proto3\";\nimport \"base.proto\";\nmessage User { Id id = 1; }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("base.proto"),
            "syntax = \"proto3\";\nmessage Id { string value = 1; }\n",
        )
        .unwrap();

        let codec = Codec::new().unwrap();
        codec.init(&[dir.path()]).unwrap();
        codec
            .encode_event("User", &json!({"id": {"value": "u"}}), "EVENT.User")
            .unwrap();
    }

    #[test]
    fn test_type_view_tags_custom_scalars() {
        let codec = Codec::new().unwrap();
        codec
            .parse(
                "message Payment { bigint amount = 1; string memo = 2; }\n\
                 service Billing { rpc pay(Payment) returns (Payment); }",
            )
            .unwrap();
        let view = codec.export_type_view("Billing").unwrap();
        assert_eq!(view.name, "Billing");
        assert_eq!(view.methods.len(), 1);
        assert_eq!(view.methods[0].name, "pay");

        let payment = view
            .messages
            .iter()
            .find(|m| m.name == "Payment")
            .expect("Payment view missing");
        let amount = payment.fields.iter().find(|f| f.name == "amount").unwrap();
        assert_eq!(amount.scalar.as_deref(), Some("bigint"));
        assert_eq!(amount.kind, "bigint");
        let memo = payment.fields.iter().find(|f| f.name == "memo").unwrap();
        assert!(memo.scalar.is_none());
        // Wrapper messages never surface as standalone types.
        assert!(view.messages.iter().all(|m| m.name != "bigint"));
    }

    #[test]
    fn test_service_methods_listing() {
        let codec = codec_with_math();
        assert_eq!(codec.service_methods("Math").unwrap(), vec!["add"]);
        assert!(matches!(
            codec.service_methods("Physics").unwrap_err(),
            CodecError::UnknownService(_)
        ));
    }
}
