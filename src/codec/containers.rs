//! Wire envelopes framing every request, response, and event.
//!
//! Field tags are wire contract: any Protobuf peer configured with the
//! same numbering interoperates regardless of language.

/// Envelope wrapping an encoded RPC request payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestContainer {
    /// Fully qualified method, `Package.Service.method`.
    #[prost(string, tag = "1")]
    pub method: String,
    /// Caller identity, empty when anonymous.
    #[prost(string, tag = "2")]
    pub actor: String,
    /// Payload encoded against the method's input type.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Envelope wrapping an RPC reply: either a result or a structured error.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseContainer {
    #[prost(oneof = "response_container::Outcome", tags = "1, 2")]
    pub outcome: Option<response_container::Outcome>,
}

pub mod response_container {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Result(super::ResponseResult),
        #[prost(message, tag = "2")]
        Error(super::ResponseError),
    }
}

/// Successful reply payload, encoded against the method's output type.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseResult {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// Structured error reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseError {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub code: String,
    /// True for business-semantic failures that must not be retried.
    #[prost(bool, tag = "3")]
    pub handled: bool,
}

/// Envelope wrapping an encoded event payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventContainer {
    /// Fully qualified event payload type.
    #[prost(string, tag = "1")]
    pub event_type: String,
    /// Routing topic the event was published under.
    #[prost(string, tag = "2")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}
