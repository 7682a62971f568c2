//! AMQP connection lifecycle.
//!
//! [`ConnectionManager`] owns the broker connection, detects transport
//! loss, and schedules reconnects with exponential backoff and jitter.
//! Components observe the lifecycle through a broadcast of
//! [`ConnectionEvent`]s and re-establish their channels when the
//! connection returns. The reconnect timer holds only a weak reference to
//! the manager, so a released runtime can wind down mid-backoff.

mod backoff;
pub(crate) mod consume;

pub use backoff::ReconnectPolicy;
pub use consume::{
    ConsumeOptions, DeliveryCallback, HandlerFailure, IncomingMessage, RetryQueues,
    DLQ_TIME_HEADER, FIRST_FAILURE_HEADER, LAST_ERROR_HEADER, ORIGINAL_QUEUE_HEADER,
    ORIGINAL_ROUTING_KEY_HEADER, RETRY_COUNT_HEADER,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{broadcast, RwLock as AsyncRwLock};
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{BusError, Result};
use consume::{spawn_consume_loop, ConsumeContext};

/// Lifecycle notifications emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The connection is up again; consumers may re-establish themselves.
    Reconnected,
    /// The transport was lost, or the caller disconnected.
    Disconnected,
    /// Terminal failure, no further reconnects will run.
    Error(String),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Declaration options for [`ConnectionManager::declare_queue`].
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Per-queue message TTL in milliseconds.
    pub message_ttl_ms: Option<u64>,
    /// Exchange expired or rejected messages are re-routed to.
    pub dead_letter_exchange: Option<String>,
}

struct Inner {
    state: std::sync::RwLock<ConnectionState>,
    connection: AsyncRwLock<Option<Connection>>,
    url: std::sync::RwLock<Option<String>>,
    policy: std::sync::RwLock<ReconnectPolicy>,
    events: broadcast::Sender<ConnectionEvent>,
    manually_closed: AtomicBool,
    reconnecting: AtomicBool,
}

/// Owns the AMQP connection and its recovery loop.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: std::sync::RwLock::new(ConnectionState::Disconnected),
                connection: AsyncRwLock::new(None),
                url: std::sync::RwLock::new(None),
                policy: std::sync::RwLock::new(ReconnectPolicy::new(ReconnectConfig::default())),
                events,
                manually_closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *read_lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the broker, retrying with backoff on initial failure.
    ///
    /// Returns once connected, or with [`BusError::ReconnectionExhausted`]
    /// after the attempt budget is spent.
    pub async fn connect(&self, url: &str, reconnect: ReconnectConfig) -> Result<()> {
        *write_lock(&self.inner.url) = Some(url.to_string());
        *write_lock(&self.inner.policy) = ReconnectPolicy::new(reconnect);
        self.inner.manually_closed.store(false, Ordering::SeqCst);

        set_state(&self.inner, ConnectionState::Connecting);
        let mut attempt: u32 = 0;
        loop {
            match Inner::establish(&self.inner, url).await {
                Ok(()) => {
                    info!(url = %url, "connected to AMQP broker");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    let policy = read_lock(&self.inner.policy).clone();
                    if !policy.allows_attempt(attempt) {
                        set_state(&self.inner, ConnectionState::Disconnected);
                        let exhausted = policy.max_retries();
                        emit(
                            &self.inner,
                            ConnectionEvent::Error(format!(
                                "reconnection attempts exhausted after {} tries",
                                exhausted
                            )),
                        );
                        return Err(BusError::ReconnectionExhausted(exhausted));
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed, retrying after backoff"
                    );
                    set_state(&self.inner, ConnectionState::Reconnecting);
                    emit(&self.inner, ConnectionEvent::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                    set_state(&self.inner, ConnectionState::Connecting);
                }
            }
        }
    }

    /// Close the connection and suppress any further reconnects.
    pub async fn disconnect(&self) {
        self.inner.manually_closed.store(true, Ordering::SeqCst);
        let connection = self.inner.connection.write().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "client shutdown").await {
                debug!(error = %e, "error closing connection");
            }
        }
        set_state(&self.inner, ConnectionState::Disconnected);
        emit(&self.inner, ConnectionEvent::Disconnected);
    }

    /// Open a fresh channel on the current connection.
    pub async fn open_channel(&self) -> Result<Channel> {
        let guard = self.inner.connection.read().await;
        let connection = guard.as_ref().ok_or(BusError::NotConnected)?;
        Ok(connection.create_channel().await?)
    }

    /// Close a channel, logging rather than propagating failures.
    pub async fn close_channel(&self, channel: Channel) {
        if let Err(e) = channel.close(200, "consumer closed").await {
            debug!(error = %e, "error closing channel");
        }
    }

    /// Declare a durable, non-auto-delete exchange.
    pub async fn declare_exchange(
        &self,
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<()> {
        channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Declare a queue and return its effective name.
    ///
    /// An empty name requests a server-named queue, declared exclusive,
    /// auto-delete, and non-durable. Named queues are durable.
    pub async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        options: QueueOptions,
    ) -> Result<String> {
        let declare = if name.is_empty() {
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                durable: false,
                ..Default::default()
            }
        } else {
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            }
        };

        let mut arguments = FieldTable::default();
        if let Some(ttl) = options.message_ttl_ms {
            arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
        }
        if let Some(exchange) = options.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.into()),
            );
        }

        let queue = channel.queue_declare(name, declare, arguments).await?;
        Ok(queue.name().to_string())
    }

    /// Bind a queue to an exchange under a routing key.
    pub async fn bind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Remove a queue binding.
    pub async fn unbind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    /// Drop all messages currently sitting in a queue.
    pub async fn purge_queue(&self, channel: &Channel, queue: &str) -> Result<u32> {
        let count = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(count)
    }

    /// Start consuming with manual acknowledgement and install the
    /// per-delivery policy handler.
    pub async fn consume(
        &self,
        channel: &Channel,
        queue: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
        options: ConsumeOptions,
    ) -> Result<()> {
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let ctx = Arc::new(ConsumeContext {
            channel: channel.clone(),
            queue: queue.to_string(),
            options,
            callback,
        });
        spawn_consume_loop(consumer, ctx);
        Ok(())
    }

    /// Cancel a consumer tag.
    pub async fn cancel_consumer(&self, channel: &Channel, consumer_tag: &str) -> Result<()> {
        channel
            .basic_cancel(consumer_tag, Default::default())
            .await?;
        Ok(())
    }

    /// Apply a prefetch bound to a channel.
    pub async fn set_prefetch(&self, channel: &Channel, prefetch: u16) -> Result<()> {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    /// Publish a message. Delegates to the transport immediately without
    /// awaiting broker confirmation.
    pub async fn publish(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        channel
            .basic_publish(
                exchange,
                routing_key,
                lapin::options::BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        Ok(())
    }
}

impl Inner {
    /// Establish a transport connection and install the loss handler.
    fn establish<'a>(
        inner: &'a Arc<Inner>,
        url: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let connection = Connection::connect(url, ConnectionProperties::default()).await?;

            let weak = Arc::downgrade(inner);
            let handle = tokio::runtime::Handle::current();
            connection.on_error(move |e| {
                let weak = weak.clone();
                handle.spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        Inner::handle_loss(inner, e.to_string()).await;
                    }
                });
            });

            *inner.connection.write().await = Some(connection);
            set_state(inner, ConnectionState::Connected);
            Ok(())
        })
    }

    /// React to a transport loss: drop the dead connection, notify, and
    /// kick off the reconnect loop unless the caller disconnected.
    async fn handle_loss(inner: Arc<Inner>, cause: String) {
        if inner.manually_closed.load(Ordering::SeqCst) {
            debug!(cause = %cause, "transport closed after manual disconnect");
            return;
        }
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(cause = %cause, "connection lost, scheduling reconnect");
        inner.connection.write().await.take();
        set_state(&inner, ConnectionState::Reconnecting);
        emit(&inner, ConnectionEvent::Disconnected);

        let weak = Arc::downgrade(&inner);
        drop(inner);
        tokio::spawn(Inner::reconnect_loop(weak));
    }

    /// Reconnect with backoff. Holds only a weak reference across sleeps
    /// so a dropped manager stops the loop.
    async fn reconnect_loop(weak: Weak<Inner>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.manually_closed.load(Ordering::SeqCst) {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            let policy = read_lock(&inner.policy).clone();
            if !policy.allows_attempt(attempt) {
                set_state(&inner, ConnectionState::Disconnected);
                inner.reconnecting.store(false, Ordering::SeqCst);
                error!(
                    attempts = attempt - 1,
                    "reconnection attempts exhausted, giving up"
                );
                emit(
                    &inner,
                    ConnectionEvent::Error(format!(
                        "reconnection attempts exhausted after {} tries",
                        policy.max_retries()
                    )),
                );
                return;
            }

            let delay = policy.delay_for_attempt(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect attempt"
            );
            emit(&inner, ConnectionEvent::Reconnecting { attempt, delay });
            drop(inner);

            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.manually_closed.load(Ordering::SeqCst) {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            set_state(&inner, ConnectionState::Connecting);
            let url = read_lock(&inner.url).clone().unwrap_or_default();
            match Inner::establish(&inner, &url).await {
                Ok(()) => {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    info!(attempt, "reconnected to AMQP broker");
                    emit(&inner, ConnectionEvent::Reconnected);
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    set_state(&inner, ConnectionState::Reconnecting);
                }
            }
        }
    }
}

fn set_state(inner: &Inner, state: ConnectionState) {
    *write_lock(&inner.state) = state;
}

fn emit(inner: &Inner, event: ConnectionEvent) {
    // Send fails only when nobody listens, which is fine.
    let _ = inner.events.send(event);
}

fn read_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
