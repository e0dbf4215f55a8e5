use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::topology::Topology;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-message publish settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Delivery mode 2 when set, 1 (transient) otherwise.
    pub persistent: bool,
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
            correlation_id: None,
            message_id: None,
            timestamp: None,
        }
    }
}

impl PublishOptions {
    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are settled by the broker on send; the handler outcome is
    /// only logged.
    pub auto_ack: bool,
    /// Maximum unacknowledged deliveries in flight. Zero means unbounded.
    pub prefetch: u16,
}

/// Payload and metadata handed to a message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl Message {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Settles one delivery with the broker. Consumed on use so a delivery is
/// settled at most once.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_parts(self) -> (Message, Box<dyn Acknowledger>) {
        (self.message, self.acker)
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A message broker the publisher and consumer talk to.
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    /// Declare exchange, queue and binding, in that order.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()>;

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}
