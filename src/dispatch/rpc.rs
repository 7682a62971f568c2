//! RPC call dispatch.
//!
//! Publishes requests to the main exchange and resolves replies through a
//! pending-call table keyed by correlation id. Every pending entry
//! completes exactly once: by reply, by timeout, or eagerly when the
//! connection drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use lapin::{BasicProperties, Channel};
use tokio::sync::{broadcast, oneshot, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::BusConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, DeliveryCallback};
use crate::consumer::ReplyConsumer;
use crate::error::{BusError, Result};

const OCTET_STREAM: &str = "application/octet-stream";
const PERSISTENT: u8 = 2;

type PendingReply = oneshot::Sender<Result<Vec<u8>>>;

struct RpcInner {
    connection: ConnectionManager,
    exchange: String,
    timeout: Duration,
    channel: AsyncRwLock<Option<Channel>>,
    pending: Mutex<HashMap<String, PendingReply>>,
    reply_consumer: ReplyConsumer,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Issues RPC calls and delivers their replies.
#[derive(Clone)]
pub struct RpcDispatcher {
    inner: Arc<RpcInner>,
}

impl RpcDispatcher {
    pub fn new(connection: ConnectionManager, config: &BusConfig) -> Self {
        let reply_consumer = ReplyConsumer::new(connection.clone(), config);
        Self {
            inner: Arc::new(RpcInner {
                connection,
                exchange: config.exchanges.requests.clone(),
                timeout: config.message_timeout(),
                channel: AsyncRwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                reply_consumer,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Open the publish channel and start the reply consumer.
    pub async fn init(&self) -> Result<()> {
        let channel = self.inner.connection.open_channel().await?;
        self.inner
            .connection
            .declare_exchange(&channel, &self.inner.exchange, lapin::ExchangeKind::Topic)
            .await?;
        *self.inner.channel.write().await = Some(channel);

        let weak = Arc::downgrade(&self.inner);
        let callback: DeliveryCallback = Arc::new(move |message| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    match message.correlation_id {
                        Some(id) => inner.resolve(&id, message.body),
                        None => warn!("reply without correlation id dropped"),
                    }
                }
                Ok(None)
            }
            .boxed()
        });
        self.inner.reply_consumer.init(callback).await?;
        self.inner.reply_consumer.start().await?;

        self.spawn_listener();
        Ok(())
    }

    /// Publish `body` under `routing_key` and await the reply.
    ///
    /// The pending entry is registered before the publish goes out; the
    /// broker may deliver the reply before the publish call returns.
    pub async fn call(&self, body: &[u8], routing_key: &str) -> Result<Vec<u8>> {
        if !self.inner.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        let reply_queue = self.inner.reply_consumer.queue().await;
        if reply_queue.is_empty() {
            return Err(BusError::NotConnected);
        }

        let correlation_id = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.inner.insert(correlation_id.clone(), tx);

        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_correlation_id(correlation_id.clone().into())
            .with_reply_to(reply_queue.into())
            .with_delivery_mode(PERSISTENT);

        if let Err(e) = self.publish_raw(routing_key, body, properties).await {
            self.inner.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender is dropped only when the table is torn down.
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                self.inner.remove(&correlation_id);
                debug!(correlation_id = %correlation_id, "rpc call timed out");
                Err(BusError::Timeout(self.inner.timeout))
            }
        }
    }

    /// Fire-and-forget publish to the main exchange.
    pub async fn publish(&self, body: &[u8], routing_key: &str) -> Result<()> {
        if !self.inner.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_correlation_id(new_correlation_id().into())
            .with_delivery_mode(PERSISTENT);
        self.publish_raw(routing_key, body, properties).await
    }

    /// Reply queue currently in effect.
    pub async fn reply_queue(&self) -> String {
        self.inner.reply_consumer.queue().await
    }

    /// Number of calls awaiting replies.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub async fn close(&self) {
        let listener = {
            let mut guard = match self.inner.listener.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        self.inner.fail_all_pending();
        self.inner.reply_consumer.close().await;
        self.inner.channel.write().await.take();
    }

    async fn publish_raw(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let guard = self.inner.channel.read().await;
        let channel = guard.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .publish(channel, &self.inner.exchange, routing_key, body, properties)
            .await
    }

    /// Drop the dead channel and fail every pending call when the
    /// connection goes; reopen the channel when it returns.
    fn spawn_listener(&self) {
        let mut guard = match self.inner.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }

        let mut events = self.inner.connection.subscribe();
        let weak: Weak<RpcInner> = Arc::downgrade(&self.inner);
        *guard = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    ConnectionEvent::Disconnected => {
                        inner.channel.write().await.take();
                        inner.fail_all_pending();
                    }
                    ConnectionEvent::Reconnected => {
                        match inner.connection.open_channel().await {
                            Ok(channel) => {
                                *inner.channel.write().await = Some(channel);
                                debug!("rpc dispatcher channel re-established");
                            }
                            Err(e) => {
                                error!(error = %e, "failed to reopen dispatcher channel")
                            }
                        }
                    }
                    _ => {}
                }
            }
        }));
    }
}

impl RpcInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingReply>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, correlation_id: String, tx: PendingReply) {
        self.lock_pending().insert(correlation_id, tx);
    }

    fn remove(&self, correlation_id: &str) {
        self.lock_pending().remove(correlation_id);
    }

    /// Complete a pending call with its reply. Late replies for timed-out
    /// or cancelled calls are dropped on the lookup miss.
    fn resolve(&self, correlation_id: &str, body: Vec<u8>) {
        let entry = self.lock_pending().remove(correlation_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(Ok(body));
            }
            None => debug!(
                correlation_id = %correlation_id,
                "reply without pending call dropped"
            ),
        }
    }

    /// Reject every pending call, used on disconnect and close.
    fn fail_all_pending(&self) {
        let drained: Vec<PendingReply> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(BusError::Disconnected));
        }
        if count > 0 {
            warn!(count, "failed pending rpc calls after disconnect");
        }
    }
}

/// 16 random bytes in hex string form.
fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique_hex() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_disconnected() {
        let dispatcher =
            RpcDispatcher::new(ConnectionManager::new(), &crate::config::BusConfig::default());
        let err = dispatcher.call(b"body", "REQUEST.Math.add").await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_completes_pending_exactly_once() {
        let dispatcher =
            RpcDispatcher::new(ConnectionManager::new(), &crate::config::BusConfig::default());
        let (tx, rx) = oneshot::channel();
        dispatcher.inner.insert("abc".to_string(), tx);
        assert_eq!(dispatcher.pending_calls(), 1);

        dispatcher.inner.resolve("abc", vec![1, 2]);
        assert_eq!(dispatcher.pending_calls(), 0);
        assert_eq!(rx.await.unwrap().unwrap(), vec![1, 2]);

        // A second resolve for the same id is a lookup miss.
        dispatcher.inner.resolve("abc", vec![3]);
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_all_pending() {
        let dispatcher =
            RpcDispatcher::new(ConnectionManager::new(), &crate::config::BusConfig::default());
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        dispatcher.inner.insert("a".to_string(), tx_a);
        dispatcher.inner.insert("b".to_string(), tx_b);

        dispatcher.inner.fail_all_pending();
        assert_eq!(dispatcher.pending_calls(), 0);
        assert!(matches!(rx_a.await.unwrap(), Err(BusError::Disconnected)));
        assert!(matches!(rx_b.await.unwrap(), Err(BusError::Disconnected)));
    }
}
