//! Event publication.

use std::sync::{Arc, Weak};

use lapin::{BasicProperties, Channel};
use serde_json::Value as Json;
use tokio::sync::{broadcast, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::BusConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{BusError, Result};

const OCTET_STREAM: &str = "application/octet-stream";
const PERSISTENT: u8 = 2;

struct EventInner {
    connection: ConnectionManager,
    codec: Arc<Codec>,
    exchange: String,
    channel: AsyncRwLock<Option<Channel>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Publishes durable, topic-routed events.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventInner>,
}

impl EventDispatcher {
    pub fn new(connection: ConnectionManager, codec: Arc<Codec>, config: &BusConfig) -> Self {
        Self {
            inner: Arc::new(EventInner {
                connection,
                codec,
                exchange: config.exchanges.events.clone(),
                channel: AsyncRwLock::new(None),
                listener: std::sync::Mutex::new(None),
            }),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let channel = self.inner.connection.open_channel().await?;
        self.inner
            .connection
            .declare_exchange(&channel, &self.inner.exchange, lapin::ExchangeKind::Topic)
            .await?;
        *self.inner.channel.write().await = Some(channel);
        self.spawn_listener();
        Ok(())
    }

    /// Encode and publish an event.
    ///
    /// The topic defaults to `EVENT.<type>`. Encoding failures surface
    /// immediately; nothing is retried here.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: &Json,
        topic: Option<&str>,
    ) -> Result<()> {
        if !self.inner.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        let topic = match topic {
            Some(topic) => topic.to_string(),
            None => format!("EVENT.{}", event_type),
        };
        let body = self.inner.codec.encode_event(event_type, payload, &topic)?;

        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_correlation_id(Uuid::new_v4().simple().to_string().into())
            .with_delivery_mode(PERSISTENT);

        let guard = self.inner.channel.read().await;
        let channel = guard.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .publish(channel, &self.inner.exchange, &topic, &body, properties)
            .await?;
        debug!(event_type = %event_type, topic = %topic, "published event");
        Ok(())
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
        self.inner.channel.write().await.take();
    }

    fn spawn_listener(&self) {
        let mut guard = match self.inner.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }

        let mut events = self.inner.connection.subscribe();
        let weak: Weak<EventInner> = Arc::downgrade(&self.inner);
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
                    }
                    ConnectionEvent::Reconnected => match inner.connection.open_channel().await {
                        Ok(channel) => {
                            *inner.channel.write().await = Some(channel);
                            debug!("event dispatcher channel re-established");
                        }
                        Err(e) => error!(error = %e, "failed to reopen event channel"),
                    },
                    _ => {}
                }
            }
        }));
    }
}
