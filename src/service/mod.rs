//! Service hosting.
//!
//! A service is a fully qualified name, a schema source, and a method
//! table. [`ServiceHost`] wires the table to an RPC consumer: incoming
//! requests are decoded, dispatched to the matching handler, and the
//! encoded response (or structured error) is returned for the reply
//! queue. Event subscriptions get a per-service event consumer dispatching
//! through the topic router.

mod proxy;

pub use proxy::ServiceProxy;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;
use tracing::{error, info};

use crate::codec::Codec;
use crate::config::{BusConfig, ServiceOptions};
use crate::connection::{ConnectionManager, DeliveryCallback, HandlerFailure};
use crate::consumer::{EventConsumer, EventHandler, RpcConsumer};
use crate::error::{Result, ServiceError};

/// Context handed to every method handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller identity from the request envelope, empty when anonymous.
    pub actor: String,
    /// Correlation id of the message being processed.
    pub correlation_id: String,
}

/// A typed request/response method.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(
        &self,
        request: Json,
        ctx: RequestContext,
    ) -> std::result::Result<Json, ServiceError>;
}

struct FnRpcHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RpcHandler for FnRpcHandler<F>
where
    F: Fn(Json, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Json, ServiceError>> + Send,
{
    async fn call(
        &self,
        request: Json,
        ctx: RequestContext,
    ) -> std::result::Result<Json, ServiceError> {
        (self.f)(request, ctx).await
    }
}

struct FnEventHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Json, String, String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), ServiceError>> + Send,
{
    async fn handle(
        &self,
        payload: Json,
        event_type: &str,
        topic: &str,
    ) -> std::result::Result<(), ServiceError> {
        (self.f)(payload, event_type.to_string(), topic.to_string()).await
    }
}

/// Where a service's schema comes from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    File(PathBuf),
    Inline(String),
}

type CleanupHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Declarative description of a service: schema, methods, subscriptions.
pub struct ServiceDefinition {
    pub(crate) name: String,
    pub(crate) schema: Option<SchemaSource>,
    pub(crate) methods: HashMap<String, Arc<dyn RpcHandler>>,
    pub(crate) subscriptions: Vec<(String, Arc<dyn EventHandler>)>,
    pub(crate) extra_bindings: Vec<String>,
    pub(crate) options: ServiceOptions,
    pub(crate) cleanup: Option<CleanupHook>,
}

impl ServiceDefinition {
    /// `name` is fully qualified, e.g. `Acme.Mailer`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            methods: HashMap::new(),
            subscriptions: Vec::new(),
            extra_bindings: Vec::new(),
            options: ServiceOptions::default(),
            cleanup: None,
        }
    }

    pub fn schema_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema = Some(SchemaSource::File(path.into()));
        self
    }

    pub fn schema_text(mut self, text: impl Into<String>) -> Self {
        self.schema = Some(SchemaSource::Inline(text.into()));
        self
    }

    /// Register a method handler under its schema name.
    pub fn method(mut self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        self.methods.insert(name.into(), handler);
        self
    }

    /// Register a closure as a method handler.
    pub fn method_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Json, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Json, ServiceError>> + Send + 'static,
    {
        self.method(name, Arc::new(FnRpcHandler { f }))
    }

    /// Subscribe to events matching `topic` (AMQP topic pattern).
    pub fn on_event(mut self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.subscriptions.push((topic.into(), handler));
        self
    }

    /// Subscribe a closure to events matching `topic`.
    pub fn on_event_fn<F, Fut>(self, topic: impl Into<String>, f: F) -> Self
    where
        F: Fn(Json, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), ServiceError>> + Send + 'static,
    {
        self.on_event(topic, Arc::new(FnEventHandler { f }))
    }

    /// Bind an additional request routing-key pattern beyond the default
    /// `REQUEST.<name>.*`.
    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.extra_bindings.push(pattern.into());
        self
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Hook run during graceful shutdown, before the consumers close.
    pub fn on_cleanup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanup = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A running service: its consumers and cleanup hook.
pub struct ServiceHost {
    name: String,
    rpc: RpcConsumer,
    events: Option<EventConsumer>,
    cleanup: Option<CleanupHook>,
}

impl ServiceHost {
    /// Parse the service schema, bind its request patterns, and start
    /// consuming.
    pub(crate) async fn start(
        connection: ConnectionManager,
        codec: Arc<Codec>,
        config: &BusConfig,
        definition: ServiceDefinition,
    ) -> Result<Self> {
        match &definition.schema {
            Some(SchemaSource::File(path)) => {
                let text = std::fs::read_to_string(path).map_err(crate::codec::CodecError::Io)?;
                codec.parse(&text)?;
            }
            Some(SchemaSource::Inline(text)) => codec.parse(text)?,
            None => {}
        }

        let rpc = RpcConsumer::new(
            connection.clone(),
            config,
            &definition.name,
            &definition.options,
        );
        let callback = rpc_callback(
            Arc::clone(&codec),
            definition.name.clone(),
            Arc::new(definition.methods),
        );
        rpc.init(callback).await?;

        let mut patterns = vec![format!("REQUEST.{}.*", definition.name)];
        patterns.extend(definition.extra_bindings.iter().cloned());
        rpc.subscribe(&patterns).await?;
        rpc.start().await?;

        let events = if definition.subscriptions.is_empty() {
            None
        } else {
            let consumer =
                EventConsumer::new(connection, config, "", &ServiceOptions::default());
            consumer.init(Arc::clone(&codec)).await?;
            for (topic, handler) in &definition.subscriptions {
                consumer.register(topic, Arc::clone(handler)).await?;
            }
            consumer.start().await?;
            Some(consumer)
        };

        info!(service = %definition.name, "service started");
        Ok(Self {
            name: definition.name,
            rpc,
            events,
            cleanup: definition.cleanup,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the cleanup hook and close the consumers. Failures are logged,
    /// shutdown continues.
    pub async fn shutdown(&self) {
        if let Some(cleanup) = &self.cleanup {
            cleanup().await;
        }
        self.rpc.close().await;
        if let Some(events) = &self.events {
            events.close().await;
        }
        info!(service = %self.name, "service stopped");
    }
}

/// Decode, dispatch, encode. Handler errors come back encoded so the
/// caller sees a structured failure; the handled flag steers the retry
/// machinery.
fn rpc_callback(
    codec: Arc<Codec>,
    service: String,
    methods: Arc<HashMap<String, Arc<dyn RpcHandler>>>,
) -> DeliveryCallback {
    Arc::new(move |message| {
        let codec = Arc::clone(&codec);
        let service = service.clone();
        let methods = Arc::clone(&methods);
        async move {
            let request = match codec.decode_request(&message.body) {
                Ok(request) => request,
                Err(e) => {
                    error!(service = %service, error = %e, "failed to decode request");
                    let err = ServiceError {
                        message: e.to_string(),
                        code: "INVALID_MESSAGE".to_string(),
                        handled: false,
                    };
                    let reply = codec.encode_error(&err);
                    return Err(HandlerFailure::invalid(err.message, Some(reply)));
                }
            };

            let method_name = request
                .method
                .strip_prefix(&format!("{}.", service))
                .unwrap_or_else(|| {
                    request.method.rsplit('.').next().unwrap_or(&request.method)
                })
                .to_string();

            let Some(handler) = methods.get(&method_name) else {
                let err = ServiceError::handled(
                    "UNKNOWN_METHOD",
                    format!("service {} has no method {}", service, method_name),
                );
                let reply = codec.encode_error(&err);
                return Err(HandlerFailure::from_service_error(err, Some(reply)));
            };

            let ctx = RequestContext {
                actor: request.actor,
                correlation_id: message.correlation_id.clone().unwrap_or_default(),
            };
            match handler.call(request.payload, ctx).await {
                Ok(response) => match codec.encode_response(&request.method, &response) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) => {
                        error!(
                            service = %service,
                            method = %method_name,
                            error = %e,
                            "failed to encode response"
                        );
                        let err = ServiceError {
                            message: e.to_string(),
                            code: "INVALID_MESSAGE".to_string(),
                            handled: false,
                        };
                        let reply = codec.encode_error(&err);
                        Err(HandlerFailure::invalid(err.message, Some(reply)))
                    }
                },
                Err(service_error) => {
                    let reply = codec.encode_error(&service_error);
                    Err(HandlerFailure::from_service_error(service_error, Some(reply)))
                }
            }
        }
        .boxed()
    })
}
