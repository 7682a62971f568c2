//! Consumer for the events topic exchange.
//!
//! Deliveries are decoded once and fanned out through the in-process
//! topic router; each matched handler runs at most once per event.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use lapin::ExchangeKind;
use serde_json::Value as Json;
use tracing::debug;

use crate::codec::Codec;
use crate::config::{BusConfig, ServiceOptions};
use crate::connection::{ConnectionManager, DeliveryCallback, HandlerFailure};
use crate::error::{Result, ServiceError};
use crate::router::TopicRouter;

use super::{BaseConsumer, ConsumerOptions};

/// Handler invoked for events matching a registered topic pattern.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Json, event_type: &str, topic: &str)
        -> std::result::Result<(), ServiceError>;
}

pub struct EventConsumer {
    base: BaseConsumer,
    router: Arc<RwLock<TopicRouter<dyn EventHandler>>>,
}

impl EventConsumer {
    /// An empty `queue` requests a server-named, exclusive queue; pass a
    /// name (and retry options) for a durable, load-balanced subscription.
    pub fn new(
        connection: ConnectionManager,
        config: &BusConfig,
        queue: &str,
        options: &ServiceOptions,
    ) -> Self {
        let base = BaseConsumer::new(
            connection,
            ConsumerOptions {
                exchange: config.exchanges.events.clone(),
                exchange_kind: ExchangeKind::Topic,
                queue: queue.to_string(),
                late_ack: options.late_ack(),
                max_concurrent: options.concurrency(),
                message_ttl_ms: options.retry.as_ref().and_then(|r| r.message_ttl_ms),
                retry: options.retry.clone(),
                callbacks_exchange: config.exchanges.callbacks.clone(),
                message_timeout: config.message_timeout(),
            },
        );
        Self {
            base,
            router: Arc::new(RwLock::new(TopicRouter::new())),
        }
    }

    pub async fn init(&self, codec: Arc<Codec>) -> Result<()> {
        let router = Arc::clone(&self.router);
        let callback: DeliveryCallback = Arc::new(move |message| {
            let codec = Arc::clone(&codec);
            let router = Arc::clone(&router);
            async move {
                let event = codec
                    .decode_event(&message.body)
                    .map_err(|e| HandlerFailure::invalid(e.to_string(), None))?;

                let handlers = match router.read() {
                    Ok(guard) => guard.matches(&event.topic),
                    Err(poisoned) => poisoned.into_inner().matches(&event.topic),
                };
                if handlers.is_empty() {
                    debug!(topic = %event.topic, "no handlers registered for event topic");
                    return Ok(None);
                }

                let mut first_error: Option<ServiceError> = None;
                for handler in handlers {
                    if let Err(e) = handler
                        .handle(event.payload.clone(), &event.event_type, &event.topic)
                        .await
                    {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                match first_error {
                    None => Ok(None),
                    Some(e) => Err(HandlerFailure::from_service_error(e, None)),
                }
            }
            .boxed()
        });
        self.base.init(callback).await
    }

    /// Bind `pattern` on the events exchange and register the handler in
    /// the router.
    pub async fn register(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.base.bind(pattern).await?;
        match self.router.write() {
            Ok(mut guard) => guard.insert(pattern, handler),
            Err(poisoned) => poisoned.into_inner().insert(pattern, handler),
        }
        Ok(())
    }

    /// Remove one handler registration; the broker binding is dropped once
    /// the pattern holds no handlers.
    pub async fn unregister(&self, pattern: &str, handler: &Arc<dyn EventHandler>) -> Result<()> {
        let now_empty = match self.router.write() {
            Ok(mut guard) => guard.remove(pattern, handler),
            Err(poisoned) => poisoned.into_inner().remove(pattern, handler),
        };
        if now_empty {
            self.base.unbind(pattern).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.base.start().await
    }

    pub async fn queue(&self) -> String {
        self.base.queue().await
    }

    pub async fn close(&self) {
        self.base.close().await
    }
}
