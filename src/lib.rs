//! protobus - broker-native microservice messaging.
//!
//! Services expose typed request/response methods, publish durable
//! topic-routed events, and consume either with retry and dead-lettering,
//! all over AMQP 0-9-1 with Protocol Buffers as the wire format. Routing
//! is broker-native: a topic exchange carries requests, a direct exchange
//! carries replies, and a second topic exchange carries events.
//!
//! ```no_run
//! use protobus::{Bus, BusConfig, ServiceDefinition};
//! use serde_json::json;
//!
//! # async fn run() -> protobus::Result<()> {
//! let bus = Bus::connect(BusConfig::default()).await?;
//!
//! let math = ServiceDefinition::new("Math")
//!     .schema_text(
//!         "service Math { rpc add(AddRequest) returns (AddResponse); }
//!          message AddRequest { int32 a = 1; int32 b = 2; }
//!          message AddResponse { int32 result = 1; }",
//!     )
//!     .method_fn("add", |request, _ctx| async move {
//!         let sum = request["a"].as_i64().unwrap_or(0) + request["b"].as_i64().unwrap_or(0);
//!         Ok(json!({ "result": sum }))
//!     });
//! let _host = bus.serve(math).await?;
//!
//! let proxy = bus.proxy("Math")?;
//! let response = proxy.call("add", &json!({"a": 1, "b": 2}), None).await?;
//! assert_eq!(response["result"], 3);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod router;
pub mod service;

pub use codec::{Codec, ScalarDescriptor, WireKind};
pub use config::{BusConfig, ReconnectConfig, RetryOptions, ServiceOptions};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use consumer::{BaseConsumer, EventConsumer, EventHandler, ReplyConsumer, RpcConsumer};
pub use dispatch::{EventDispatcher, RpcDispatcher};
pub use error::{BusError, Result, ServiceError};
pub use host::{init_tracing, Bus, Host};
pub use router::TopicRouter;
pub use service::{
    RequestContext, RpcHandler, SchemaSource, ServiceDefinition, ServiceHost, ServiceProxy,
};
