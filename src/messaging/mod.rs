//! Broker side of the runtime: topology declared once per handle, a
//! serialized publisher, and a consumer with ack/requeue semantics.

pub mod amqp;
pub mod backend;
pub mod consumer;
pub mod errors;
pub mod memory;
pub mod publisher;
pub mod topology;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

pub use amqp::AmqpBackend;
pub use backend::{
    Acknowledger, BrokerBackend, ConsumeOptions, Delivery, DeliveryStream, Message,
    PublishOptions, JSON_CONTENT_TYPE,
};
pub use consumer::{Consumer, ConsumerHandle, MessageHandler};
pub use errors::{BrokerError, Result};
pub use memory::{MemoryBackend, QueueStats};
pub use publisher::Publisher;
pub use topology::{topic_matches, ExchangeMode, Topology};

use crate::config::BrokerConfig;

pub(crate) struct BrokerShared {
    backend: Arc<dyn BrokerBackend>,
    topology: Topology,
    publish_lock: Mutex<()>,
}

/// A broker connection with its topology declared.
///
/// Publishers and consumers handed out by one `Broker` share its backend and
/// its publish lock.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Declare `topology` on `backend` and return the handle.
    ///
    /// Fails if any declare or bind step fails. Steps that succeeded before
    /// the failure are not undone on the broker.
    pub async fn new<B>(backend: B, topology: Topology) -> Result<Self>
    where
        B: BrokerBackend + 'static,
    {
        Self::with_backend(Arc::new(backend), topology).await
    }

    pub async fn with_backend(backend: Arc<dyn BrokerBackend>, topology: Topology) -> Result<Self> {
        topology.validate()?;
        backend.declare(&topology).await.map_err(|e| {
            error!(
                backend = backend.name(),
                exchange = %topology.exchange,
                queue = %topology.queue,
                error = %e,
                "Topology declaration failed"
            );
            match e {
                BrokerError::TopologyDeclaration { .. } => e,
                other => BrokerError::topology(format!("exchange {}", topology.exchange), other),
            }
        })?;

        Ok(Self {
            shared: Arc::new(BrokerShared {
                backend,
                topology,
                publish_lock: Mutex::new(()),
            }),
        })
    }

    /// Connect to RabbitMQ and declare the configured topology.
    pub async fn connect_amqp(config: &BrokerConfig) -> Result<Self> {
        let backend = AmqpBackend::connect(config).await?;
        Self::new(backend, config.topology()).await
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.shared.clone())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.shared.clone())
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn is_connected(&self) -> bool {
        self.shared.backend.is_connected()
    }

    /// Close the broker connection. Cancel consumers and stop publishing
    /// first; deliveries still in flight can no longer be acknowledged.
    pub async fn close(&self) -> Result<()> {
        info!(backend = self.shared.backend.name(), "Closing broker");
        self.shared.backend.close().await
    }
}
