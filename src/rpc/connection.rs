use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::channel::RpcChannel;
use super::dialer::{Dialer, TonicDialer};
use super::errors::{ConnectionError, Result};
use super::interceptor;
use super::registry::ClientRegistry;
use crate::config::ServiceConfig;

/// Configs, channels and cached clients live under one lock so a channel
/// and the client derived from it are never out of step.
struct ConnectionState<C> {
    order: Vec<String>,
    configs: HashMap<String, ServiceConfig>,
    channels: HashMap<String, RpcChannel>,
    clients: HashMap<String, C>,
}

impl<C> ConnectionState<C> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            configs: HashMap::new(),
            channels: HashMap::new(),
            clients: HashMap::new(),
        }
    }
}

/// Owns one long-lived channel per registered backend service.
///
/// Channels are dialed lazily by [`connect`](Self::connect) or eagerly by
/// [`connect_all`](Self::connect_all), wrapped in the interceptor chain, and
/// handed out as typed clients built by the [`ClientRegistry`].
pub struct ConnectionManager<C> {
    registry: Arc<ClientRegistry<C>>,
    dialer: Arc<dyn Dialer>,
    state: RwLock<ConnectionState<C>>,
}

impl<C> ConnectionManager<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<ClientRegistry<C>>) -> Self {
        Self::with_dialer(registry, Arc::new(TonicDialer))
    }

    pub fn with_dialer(registry: Arc<ClientRegistry<C>>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            registry,
            dialer,
            state: RwLock::new(ConnectionState::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry<C>> {
        &self.registry
    }

    /// Record the config for a service. Does not connect.
    ///
    /// Registering a name again replaces its config; the new config is used
    /// by the next dial, while an already open channel is left as is.
    pub async fn register(&self, config: ServiceConfig) -> Result<()> {
        config.validate().map_err(ConnectionError::InvalidConfig)?;

        let mut state = self.state.write().await;
        let name = config.name.clone();
        info!(service = %name, address = %config.address, "Registering service");
        if state.configs.insert(name.clone(), config).is_none() {
            state.order.push(name);
        }
        Ok(())
    }

    /// Dial `name` unless a channel for it is already open.
    ///
    /// The exclusive lock is held for the whole dial, which is bounded by the
    /// service timeout.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.channels.contains_key(name) {
            debug!(service = %name, "Already connected");
            return Ok(());
        }

        let config = state
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::ServiceNotRegistered(name.to_string()))?;

        info!(
            service = %name,
            address = %config.address,
            timeout_ms = config.timeout().as_millis() as u64,
            retry = config.retry_policy().map_or(0, |p| p.max),
            "Connecting to service"
        );
        let started = Instant::now();

        let transport = self.dialer.dial(&config).await.map_err(|source| {
            error!(service = %name, address = %config.address, error = %source, "Dial failed");
            ConnectionError::DialFailure {
                service: name.to_string(),
                source,
            }
        })?;

        let channel = RpcChannel::new(
            name,
            config.address.clone(),
            interceptor::intercept(&config, transport),
        );
        state.channels.insert(name.to_string(), channel);

        info!(
            service = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connected to service"
        );
        Ok(())
    }

    /// Connect every registered service in registration order.
    ///
    /// Stops at the first failure and returns it. Channels opened before the
    /// failure stay open; call [`close`](Self::close) for all-or-nothing.
    pub async fn connect_all(&self) -> Result<()> {
        let names = self.state.read().await.order.clone();
        for name in names {
            if let Err(e) = self.connect(&name).await {
                warn!(service = %name, "Stopping connect_all at first failure");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn get_connection(&self, name: &str) -> Result<RpcChannel> {
        self.state
            .read()
            .await
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::ConnectionNotFound(name.to_string()))
    }

    /// The cached typed client for `name`, built on first use.
    ///
    /// The factory runs under the exclusive lock after a second cache check,
    /// so concurrent first callers share a single factory invocation.
    pub async fn get_client(&self, name: &str) -> Result<C> {
        if let Some(client) = self.state.read().await.clients.get(name) {
            return Ok(client.clone());
        }

        let mut state = self.state.write().await;
        if let Some(client) = state.clients.get(name) {
            return Ok(client.clone());
        }

        let channel = state
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::ConnectionNotFound(name.to_string()))?;

        let client = self.registry.create_client(name, channel)?;
        state.clients.insert(name.to_string(), client.clone());
        debug!(service = %name, "Cached typed client");
        Ok(client)
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.state.read().await.channels.contains_key(name)
    }

    /// Registered service names, in registration order.
    pub async fn services(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    /// Close every channel and forget all configs, channels and clients.
    ///
    /// The maps are cleared even when some channels fail to close, so a new
    /// register and connect cycle starts clean.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let total = state.channels.len();
        let mut failed = 0;

        for (name, channel) in state.channels.drain() {
            match channel.close() {
                Ok(()) => debug!(service = %name, "Closed channel"),
                Err(e) => {
                    failed += 1;
                    warn!(service = %name, error = %e, "Failed to close channel");
                }
            }
        }
        state.clients.clear();
        state.configs.clear();
        state.order.clear();

        if failed > 0 {
            error!(failed, total, "Closed connections with failures");
            return Err(ConnectionError::CloseFailure { failed, total });
        }
        if total > 0 {
            info!(total, "Closed all connections");
        }
        Ok(())
    }
}
