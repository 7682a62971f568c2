//! Language-neutral type descriptions for code generators.
//!
//! [`ServiceView`] flattens a service descriptor and every message and
//! enum reachable from its methods into plain serializable records. Custom
//! scalar wrappers surface as scalar tags on the referencing field, never
//! as message types of their own.

use std::collections::BTreeMap;

use prost_reflect::{EnumDescriptor, Kind, MessageDescriptor, ServiceDescriptor};
use serde::Serialize;

use super::scalars::ScalarRegistry;

/// Description of a service and its reachable types.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub methods: Vec<MethodView>,
    pub messages: Vec<MessageView>,
    pub enums: Vec<EnumView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodView {
    pub name: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub name: String,
    pub fields: Vec<FieldView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub name: String,
    /// Scalar kind, enum or message full name, or custom scalar name.
    pub kind: String,
    pub repeated: bool,
    pub map: bool,
    /// True when absence is observable (message fields, optionals,
    /// oneof members).
    pub nullable: bool,
    /// Custom scalar tag when the field is backed by a registered wrapper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumView {
    pub name: String,
    pub values: Vec<EnumValueView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumValueView {
    pub name: String,
    pub number: i32,
}

pub(crate) fn render_service(
    service: &ServiceDescriptor,
    scalars: &ScalarRegistry,
) -> ServiceView {
    let mut messages = BTreeMap::new();
    let mut enums = BTreeMap::new();

    let mut methods = Vec::new();
    for method in service.methods() {
        collect_message(&method.input(), scalars, &mut messages, &mut enums);
        collect_message(&method.output(), scalars, &mut messages, &mut enums);
        methods.push(MethodView {
            name: method.name().to_string(),
            input: method.input().full_name().to_string(),
            output: method.output().full_name().to_string(),
        });
    }

    ServiceView {
        name: service.full_name().to_string(),
        methods,
        messages: messages.into_values().collect(),
        enums: enums.into_values().collect(),
    }
}

fn collect_message(
    desc: &MessageDescriptor,
    scalars: &ScalarRegistry,
    messages: &mut BTreeMap<String, MessageView>,
    enums: &mut BTreeMap<String, EnumView>,
) {
    let name = desc.full_name().to_string();
    if messages.contains_key(&name) || scalars.get(&name).is_some() {
        return;
    }
    // Reserve the slot before recursing so cyclic references terminate.
    messages.insert(
        name.clone(),
        MessageView {
            name: name.clone(),
            fields: Vec::new(),
        },
    );

    let mut fields = Vec::new();
    for field in desc.fields() {
        let (kind, scalar) = match field.kind() {
            Kind::Message(inner) => {
                if let Some(s) = scalars.get(inner.full_name()) {
                    (s.name.clone(), Some(s.name.clone()))
                } else {
                    collect_message(&inner, scalars, messages, enums);
                    (inner.full_name().to_string(), None)
                }
            }
            Kind::Enum(inner) => {
                collect_enum(&inner, enums);
                (inner.full_name().to_string(), None)
            }
            other => (scalar_kind_name(&other).to_string(), None),
        };
        fields.push(FieldView {
            name: field.name().to_string(),
            kind,
            repeated: field.is_list(),
            map: field.is_map(),
            nullable: field.supports_presence(),
            scalar,
        });
    }

    if let Some(view) = messages.get_mut(&name) {
        view.fields = fields;
    }
}

fn collect_enum(desc: &EnumDescriptor, enums: &mut BTreeMap<String, EnumView>) {
    let name = desc.full_name().to_string();
    enums.entry(name.clone()).or_insert_with(|| EnumView {
        name,
        values: desc
            .values()
            .map(|v| EnumValueView {
                name: v.name().to_string(),
                number: v.number(),
            })
            .collect(),
    });
}

fn scalar_kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) | Kind::Enum(_) => "message",
    }
}
