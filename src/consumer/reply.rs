//! Consumer for RPC replies.
//!
//! An anonymous, exclusive, auto-delete queue on the callbacks direct
//! exchange, bound under its own server-assigned name. Replies are
//! matched to pending calls by correlation id upstream in the dispatcher.

use lapin::ExchangeKind;

use crate::config::BusConfig;
use crate::connection::{ConnectionManager, DeliveryCallback};
use crate::error::Result;

use super::{BaseConsumer, ConsumerOptions};

pub struct ReplyConsumer {
    base: BaseConsumer,
}

impl ReplyConsumer {
    pub fn new(connection: ConnectionManager, config: &BusConfig) -> Self {
        let base = BaseConsumer::new(
            connection,
            ConsumerOptions {
                exchange: config.exchanges.callbacks.clone(),
                exchange_kind: ExchangeKind::Direct,
                queue: String::new(),
                late_ack: false,
                max_concurrent: 1,
                message_ttl_ms: None,
                retry: None,
                callbacks_exchange: config.exchanges.callbacks.clone(),
                message_timeout: config.message_timeout(),
            },
        );
        Self { base }
    }

    pub async fn init(&self, callback: DeliveryCallback) -> Result<()> {
        self.base.init(callback).await
    }

    pub async fn start(&self) -> Result<()> {
        self.base.start().await
    }

    /// Server-assigned reply queue name; doubles as the reply routing key.
    /// Changes after every reconnect.
    pub async fn queue(&self) -> String {
        self.base.queue().await
    }

    pub async fn close(&self) {
        self.base.close().await
    }
}
