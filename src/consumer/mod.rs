//! Queue consumers.
//!
//! [`BaseConsumer`] owns a channel, the declared exchange and queue, and
//! the tracked bindings. It listens for connection lifecycle events and
//! transparently re-declares, re-binds, and resumes consumption after a
//! reconnect. [`RpcConsumer`], [`EventConsumer`], and [`ReplyConsumer`]
//! specialize it for the three exchanges.

mod event;
mod reply;
mod rpc;

pub use event::{EventConsumer, EventHandler};
pub use reply::ReplyConsumer;
pub use rpc::RpcConsumer;

use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::{Channel, ExchangeKind};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::RetryOptions;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConsumeOptions, DeliveryCallback, QueueOptions,
    RetryQueues,
};
use crate::error::{BusError, Result};

/// Static configuration of a consumer.
#[derive(Clone)]
pub struct ConsumerOptions {
    /// Exchange the queue binds to.
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Configured queue name; empty requests a server-named queue.
    pub queue: String,
    /// Defer acknowledgement until the handler finishes.
    pub late_ack: bool,
    /// Prefetch bound applied in late-ack mode.
    pub max_concurrent: u16,
    /// Optional per-queue message TTL.
    pub message_ttl_ms: Option<u64>,
    /// Retry policy; requires a named queue.
    pub retry: Option<RetryOptions>,
    /// Exchange RPC replies are published to.
    pub callbacks_exchange: String,
    /// Bound on a single handler invocation.
    pub message_timeout: Duration,
}

#[derive(Default)]
struct ConsumerState {
    channel: Option<Channel>,
    /// Queue name currently in effect; differs from the configured name
    /// for server-named queues.
    queue: String,
    consumer_tag: Option<String>,
    bindings: Vec<String>,
    started: bool,
    callback: Option<DeliveryCallback>,
    retry: Option<RetryQueues>,
}

/// Declares its exchange and queue, tracks bindings, and survives
/// reconnects.
pub struct BaseConsumer {
    connection: ConnectionManager,
    options: ConsumerOptions,
    state: Arc<AsyncMutex<ConsumerState>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BaseConsumer {
    pub fn new(connection: ConnectionManager, options: ConsumerOptions) -> Self {
        Self {
            connection,
            options,
            state: Arc::new(AsyncMutex::new(ConsumerState::default())),
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Declare the exchange and queue and install the delivery callback.
    ///
    /// Requires an established connection and a configured exchange name.
    pub async fn init(&self, callback: DeliveryCallback) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        if self.options.exchange.is_empty() {
            return Err(BusError::Configuration(
                "consumer exchange name is not configured".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        state.callback = Some(callback);
        initialize(&self.connection, &self.options, &mut state).await?;
        drop(state);

        self.spawn_listener();
        Ok(())
    }

    /// Begin consuming under a fresh random consumer tag.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        start_consuming(&self.connection, &self.options, &mut state).await
    }

    /// Bind the queue under `routing_key` and remember the binding for
    /// reconnects.
    pub async fn bind(&self, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        self.connection
            .bind_queue(channel, &state.queue, &self.options.exchange, routing_key)
            .await?;
        if !state.bindings.iter().any(|b| b == routing_key) {
            state.bindings.push(routing_key.to_string());
        }
        Ok(())
    }

    /// Remove a binding and forget it.
    pub async fn unbind(&self, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        self.connection
            .unbind_queue(channel, &state.queue, &self.options.exchange, routing_key)
            .await?;
        state.bindings.retain(|b| b != routing_key);
        Ok(())
    }

    /// Queue name currently in effect.
    pub async fn queue(&self) -> String {
        self.state.lock().await.queue.clone()
    }

    /// Routing keys currently tracked for reconnection.
    pub async fn bindings(&self) -> Vec<String> {
        self.state.lock().await.bindings.clone()
    }

    pub(crate) fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Declare the retry and dead-letter queues for this consumer.
    pub(crate) async fn enable_retry(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        setup_retry_queues(&self.connection, &self.options, &mut state).await
    }

    /// Stop consuming, release the channel, and drop retained state.
    pub async fn close(&self) {
        if let Some(listener) = take_listener(&self.listener) {
            listener.abort();
        }
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            if let Some(tag) = state.consumer_tag.take() {
                if let Err(e) = self.connection.cancel_consumer(&channel, &tag).await {
                    debug!(error = %e, "error cancelling consumer");
                }
            }
            self.connection.close_channel(channel).await;
        }
        *state = ConsumerState::default();
    }

    /// Watch connection lifecycle events and recover after reconnects.
    fn spawn_listener(&self) {
        let mut guard = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }

        let mut events = self.connection.subscribe();
        let connection = self.connection.clone();
        let options = self.options.clone();
        let state: Weak<AsyncMutex<ConsumerState>> = Arc::downgrade(&self.state);

        *guard = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(state) = state.upgrade() else {
                    return;
                };
                match event {
                    ConnectionEvent::Disconnected => {
                        let mut state = state.lock().await;
                        state.channel = None;
                        state.consumer_tag = None;
                        debug!(queue = %options.queue, "consumer channel invalidated");
                    }
                    ConnectionEvent::Reconnected => {
                        let mut state = state.lock().await;
                        match reestablish(&connection, &options, &mut state).await {
                            Ok(()) => {
                                info!(queue = %state.queue, "consumer re-established after reconnect")
                            }
                            Err(e) => {
                                error!(
                                    queue = %options.queue,
                                    error = %e,
                                    "failed to re-establish consumer"
                                )
                            }
                        }
                    }
                    _ => {}
                }
            }
        }));
    }
}

impl Drop for BaseConsumer {
    fn drop(&mut self) {
        if let Some(listener) = take_listener(&self.listener) {
            listener.abort();
        }
    }
}

fn take_listener(
    listener: &std::sync::Mutex<Option<JoinHandle<()>>>,
) -> Option<JoinHandle<()>> {
    match listener.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Open a channel and declare the exchange and queue.
///
/// Server-named queues come back with a fresh name, recorded as the
/// effective queue. Direct exchanges get the self-binding that routes
/// reply traffic by queue name.
async fn initialize(
    connection: &ConnectionManager,
    options: &ConsumerOptions,
    state: &mut ConsumerState,
) -> Result<()> {
    let channel = connection.open_channel().await?;
    if options.late_ack {
        connection
            .set_prefetch(&channel, options.max_concurrent)
            .await?;
    }
    connection
        .declare_exchange(&channel, &options.exchange, options.exchange_kind.clone())
        .await?;
    let queue = connection
        .declare_queue(
            &channel,
            &options.queue,
            QueueOptions {
                message_ttl_ms: options.message_ttl_ms,
                dead_letter_exchange: None,
            },
        )
        .await?;
    if matches!(options.exchange_kind, ExchangeKind::Direct) {
        connection
            .bind_queue(&channel, &queue, &options.exchange, &queue)
            .await?;
    }

    state.queue = queue;
    state.channel = Some(channel);

    if state.retry.is_some() {
        setup_retry_queues(connection, options, state).await?;
    }
    Ok(())
}

/// Declare `<queue>.Retry` and `<queue>.DLQ`.
///
/// The retry queue holds failed messages for the configured delay, then
/// dead-letters them back to the consumer's exchange under the retry
/// queue's own name; an extra binding on the service queue picks them up
/// again. The first-delivery routing key rides in a message header.
async fn setup_retry_queues(
    connection: &ConnectionManager,
    options: &ConsumerOptions,
    state: &mut ConsumerState,
) -> Result<()> {
    let Some(retry) = options.retry.as_ref() else {
        return Ok(());
    };
    if options.queue.is_empty() {
        return Err(BusError::Configuration(
            "retry requires a named queue".to_string(),
        ));
    }
    let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;

    let retry_queue = format!("{}.Retry", state.queue);
    let dlq_queue = format!("{}.DLQ", state.queue);

    connection
        .declare_queue(
            channel,
            &retry_queue,
            QueueOptions {
                message_ttl_ms: Some(retry.retry_delay_ms),
                dead_letter_exchange: Some(options.exchange.clone()),
            },
        )
        .await?;
    connection
        .declare_queue(channel, &dlq_queue, QueueOptions::default())
        .await?;
    connection
        .bind_queue(channel, &state.queue, &options.exchange, &retry_queue)
        .await?;

    state.retry = Some(RetryQueues {
        max_retries: retry.max_retries,
        retry_queue,
        dlq_queue,
    });
    Ok(())
}

async fn start_consuming(
    connection: &ConnectionManager,
    options: &ConsumerOptions,
    state: &mut ConsumerState,
) -> Result<()> {
    let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
    let callback = state.callback.clone().ok_or_else(|| {
        BusError::Configuration("consumer started before init".to_string())
    })?;

    let consumer_tag = format!("ctag-{}", uuid::Uuid::new_v4().simple());
    connection
        .consume(
            channel,
            &state.queue,
            &consumer_tag,
            callback,
            ConsumeOptions {
                late_ack: options.late_ack,
                timeout: options.message_timeout,
                callbacks_exchange: options.callbacks_exchange.clone(),
                retry: state.retry.clone(),
            },
        )
        .await?;
    state.consumer_tag = Some(consumer_tag);
    state.started = true;
    Ok(())
}

/// Reconnect recovery: re-declare everything, re-apply tracked bindings,
/// and resume consumption when it was running before.
async fn reestablish(
    connection: &ConnectionManager,
    options: &ConsumerOptions,
    state: &mut ConsumerState,
) -> Result<()> {
    initialize(connection, options, state).await?;

    let bindings = state.bindings.clone();
    let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
    for routing_key in &bindings {
        connection
            .bind_queue(channel, &state.queue, &options.exchange, routing_key)
            .await?;
    }

    if state.started {
        start_consuming(connection, options, state).await?;
    }
    Ok(())
}
