//! Runtime wiring and process lifecycle.
//!
//! [`Bus`] owns the connection, the codec, and both dispatchers; it is the
//! single owner the other components borrow the connection from. [`Host`]
//! drives a set of services from connect to signal-triggered shutdown.

use std::sync::Arc;

use tracing::{error, info};

use crate::codec::Codec;
use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::{EventDispatcher, RpcDispatcher};
use crate::error::Result;
use crate::service::{ServiceDefinition, ServiceHost, ServiceProxy};

/// The connected runtime.
pub struct Bus {
    connection: ConnectionManager,
    codec: Arc<Codec>,
    rpc: RpcDispatcher,
    events: EventDispatcher,
    config: BusConfig,
}

impl Bus {
    /// Build the runtime: parse schemas, connect, and initialize the
    /// dispatchers.
    pub async fn connect(config: BusConfig) -> Result<Arc<Self>> {
        let codec = Arc::new(Codec::new()?);
        if !config.schema_dirs.is_empty() {
            codec.init(&config.schema_dirs)?;
        }

        let connection = ConnectionManager::new();
        connection
            .connect(&config.url, config.reconnect.clone())
            .await?;

        let rpc = RpcDispatcher::new(connection.clone(), &config);
        rpc.init().await?;

        let events = EventDispatcher::new(connection.clone(), Arc::clone(&codec), &config);
        events.init().await?;

        Ok(Arc::new(Self {
            connection,
            codec,
            rpc,
            events,
            config,
        }))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// RPC dispatcher for raw calls; prefer [`Bus::proxy`].
    pub fn rpc(&self) -> &RpcDispatcher {
        &self.rpc
    }

    /// Event dispatcher for publishing.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Start hosting a service.
    pub async fn serve(&self, definition: ServiceDefinition) -> Result<ServiceHost> {
        ServiceHost::start(
            self.connection.clone(),
            Arc::clone(&self.codec),
            &self.config,
            definition,
        )
        .await
    }

    /// Build a typed client for a remote service.
    pub fn proxy(&self, service: &str) -> Result<ServiceProxy> {
        ServiceProxy::new(Arc::clone(&self.codec), self.rpc.clone(), service)
    }

    /// Tear down dispatchers and close the connection.
    pub async fn shutdown(&self) {
        self.rpc.close().await;
        self.events.close().await;
        self.connection.disconnect().await;
    }
}

/// Bootstraps services and runs until a termination signal arrives.
pub struct Host {
    config: BusConfig,
    definitions: Vec<ServiceDefinition>,
}

impl Host {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            definitions: Vec::new(),
        }
    }

    pub fn register(mut self, definition: ServiceDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Connect, start every registered service, and block until SIGINT or
    /// SIGTERM. Cleanup failures are logged and shutdown continues.
    pub async fn run(self) -> Result<()> {
        let bus = Bus::connect(self.config).await?;

        let mut hosts = Vec::new();
        for definition in self.definitions {
            let name = definition.name().to_string();
            match bus.serve(definition).await {
                Ok(host) => hosts.push(host),
                Err(e) => {
                    error!(service = %name, error = %e, "failed to start service");
                    for host in &hosts {
                        host.shutdown().await;
                    }
                    bus.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!(services = hosts.len(), "host running, waiting for shutdown signal");
        shutdown_signal().await;
        info!("shutdown signal received");

        for host in &hosts {
            host.shutdown().await;
        }
        bus.shutdown().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}

/// Install the default tracing subscriber, honoring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
