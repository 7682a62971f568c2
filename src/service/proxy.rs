//! Typed client surface for a remote service.
//!
//! The proxy is a lookup keyed by method name over the service's schema
//! descriptor: it validates the method, encodes the request, dispatches
//! it, and decodes the reply. Generated clients sit on top of
//! [`ServiceProxy::call`].

use std::sync::Arc;

use serde_json::Value as Json;

use crate::codec::{Codec, DecodedResponse};
use crate::dispatch::RpcDispatcher;
use crate::error::{BusError, Result};

pub struct ServiceProxy {
    codec: Arc<Codec>,
    dispatcher: RpcDispatcher,
    service: String,
    methods: Vec<String>,
}

impl ServiceProxy {
    /// Resolve `service` against the schema registry.
    ///
    /// Fails when the service is unknown; the schema must be registered
    /// before proxies are built.
    pub fn new(
        codec: Arc<Codec>,
        dispatcher: RpcDispatcher,
        service: impl Into<String>,
    ) -> Result<Self> {
        let service = service.into();
        let methods = codec.service_methods(&service)?;
        Ok(Self {
            codec,
            dispatcher,
            service,
            methods,
        })
    }

    /// Methods the target service declares.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke `method` with `payload`, returning the decoded response.
    ///
    /// Remote errors surface as [`BusError::Service`] with the message,
    /// code, and handled flag the service raised.
    pub async fn call(&self, method: &str, payload: &Json, actor: Option<&str>) -> Result<Json> {
        if !self.methods.iter().any(|m| m == method) {
            return Err(BusError::Codec(crate::codec::CodecError::UnknownMethod(
                format!("{}.{}", self.service, method),
            )));
        }

        let full_method = format!("{}.{}", self.service, method);
        let body = self
            .codec
            .encode_request(&full_method, payload, actor.unwrap_or_default())?;
        let routing_key = format!("REQUEST.{}.{}", self.service, method);

        let reply = self.dispatcher.call(&body, &routing_key).await?;
        match self.codec.decode_response(&full_method, &reply)? {
            DecodedResponse::Result(data) => Ok(data),
            DecodedResponse::Error(e) => Err(BusError::Service {
                message: e.message,
                code: e.code,
                handled: e.handled,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::connection::ConnectionManager;
    use serde_json::json;

    fn proxy_fixture() -> ServiceProxy {
        let codec = Arc::new(Codec::new().unwrap());
        codec
            .parse(
                "service Math { rpc add(AddRequest) returns (AddResponse); }\n\
                 message AddRequest { int32 a = 1; int32 b = 2; }\n\
                 message AddResponse { int32 result = 1; }",
            )
            .unwrap();
        let dispatcher = RpcDispatcher::new(ConnectionManager::new(), &BusConfig::default());
        ServiceProxy::new(codec, dispatcher, "Math").unwrap()
    }

    #[test]
    fn test_methods_resolved_from_schema() {
        let proxy = proxy_fixture();
        assert_eq!(proxy.methods(), ["add"]);
        assert_eq!(proxy.service(), "Math");
    }

    #[test]
    fn test_unknown_service_rejected() {
        let codec = Arc::new(Codec::new().unwrap());
        let dispatcher = RpcDispatcher::new(ConnectionManager::new(), &BusConfig::default());
        assert!(ServiceProxy::new(codec, dispatcher, "Nope").is_err());
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_locally() {
        let proxy = proxy_fixture();
        let err = proxy
            .call("subtract", &json!({"a": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Codec(crate::codec::CodecError::UnknownMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_call_requires_connection() {
        let proxy = proxy_fixture();
        let err = proxy
            .call("add", &json!({"a": 1, "b": 2}), Some("tester"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }
}
