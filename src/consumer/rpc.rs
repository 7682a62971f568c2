//! Consumer for RPC request queues on the main topic exchange.

use lapin::ExchangeKind;

use crate::config::{BusConfig, ServiceOptions};
use crate::connection::{ConnectionManager, DeliveryCallback};
use crate::error::Result;

use super::{BaseConsumer, ConsumerOptions};

/// Consumes a service's request queue with bounded concurrency and the
/// retry/dead-letter wiring from the service options.
pub struct RpcConsumer {
    base: BaseConsumer,
}

impl RpcConsumer {
    pub fn new(
        connection: ConnectionManager,
        config: &BusConfig,
        queue: &str,
        options: &ServiceOptions,
    ) -> Self {
        let base = BaseConsumer::new(
            connection,
            ConsumerOptions {
                exchange: config.exchanges.requests.clone(),
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
        Self { base }
    }

    pub async fn init(&self, callback: DeliveryCallback) -> Result<()> {
        self.base.init(callback).await
    }

    /// Bind the request queue under each routing-key pattern. Patterns are
    /// tracked and re-applied after reconnects. With retry enabled this
    /// also declares the retry and dead-letter queues.
    pub async fn subscribe(&self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            self.base.bind(pattern).await?;
        }
        if self.base.options().retry.is_some() && !self.base.options().queue.is_empty() {
            self.base.enable_retry().await?;
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
