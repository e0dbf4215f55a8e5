use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{
    Acknowledger, BrokerBackend, ConsumeOptions, Delivery, DeliveryStream, Message,
    PublishOptions,
};
use super::errors::{BrokerError, Result};
use super::topology::{ExchangeMode, Topology};

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: u64,
    pub requeued: u64,
}

/// In-process broker with AMQP routing and acknowledgement semantics.
///
/// Useful for tests and for running the runtime without RabbitMQ. Messages
/// live only as long as the backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct MemoryState {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, Arc<MemoryQueue>>,
}

struct MemoryExchange {
    mode: ExchangeMode,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct MemoryQueue {
    durable: bool,
    auto_delete: bool,
    contents: Mutex<QueueContents>,
    available: Notify,
}

#[derive(Default)]
struct QueueContents {
    ready: VecDeque<Message>,
    unacked: usize,
    acked: u64,
    requeued: u64,
}

impl MemoryInner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryQueue {
    fn new(durable: bool, auto_delete: bool) -> Self {
        Self {
            durable,
            auto_delete,
            contents: Mutex::new(QueueContents::default()),
            available: Notify::new(),
        }
    }

    fn contents(&self) -> MutexGuard<'_, QueueContents> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: Message) {
        self.contents().ready.push_back(message);
        self.available.notify_one();
    }

    fn pop(&self, auto_ack: bool) -> Option<Message> {
        let mut contents = self.contents();
        let message = contents.ready.pop_front()?;
        if auto_ack {
            contents.acked += 1;
        } else {
            contents.unacked += 1;
        }
        Some(message)
    }

    fn settle(&self, acked: bool) {
        let mut contents = self.contents();
        contents.unacked = contents.unacked.saturating_sub(1);
        if acked {
            contents.acked += 1;
        }
    }

    /// Requeued messages go back to the head of the queue.
    fn requeue(&self, mut message: Message) {
        message.redelivered = true;
        {
            let mut contents = self.contents();
            contents.unacked = contents.unacked.saturating_sub(1);
            contents.requeued += 1;
            contents.ready.push_front(message);
        }
        self.available.notify_one();
    }

    fn stats(&self) -> QueueStats {
        let contents = self.contents();
        QueueStats {
            ready: contents.ready.len(),
            unacked: contents.unacked,
            acked: contents.acked,
            requeued: contents.requeued,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `queue`, or `None` if it was never declared.
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.inner.state().queues.get(queue).map(|q| q.stats())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.ensure_connected()?;
        topology.validate()?;
        let mut state = self.inner.state();

        match state.exchanges.entry(topology.exchange.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.mode != topology.mode || existing.durable != topology.durable {
                    return Err(BrokerError::topology(
                        format!("exchange {}", topology.exchange),
                        format!(
                            "already declared as {} (durable={})",
                            existing.mode, existing.durable
                        ),
                    ));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(MemoryExchange {
                    mode: topology.mode,
                    durable: topology.durable,
                    bindings: Vec::new(),
                });
            }
        }

        match state.queues.entry(topology.queue.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.durable != topology.durable
                    || existing.auto_delete != topology.auto_delete
                {
                    return Err(BrokerError::topology(
                        format!("queue {}", topology.queue),
                        format!(
                            "already declared with durable={} auto_delete={}",
                            existing.durable, existing.auto_delete
                        ),
                    ));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(MemoryQueue::new(
                    topology.durable,
                    topology.auto_delete,
                )));
            }
        }

        if let Some(exchange) = state.exchanges.get_mut(&topology.exchange) {
            let binding = (topology.queue.clone(), topology.binding.clone());
            if !exchange.bindings.contains(&binding) {
                exchange.bindings.push(binding);
            }
        }

        info!(
            exchange = %topology.exchange,
            mode = %topology.mode,
            queue = %topology.queue,
            binding = %topology.binding,
            "Declared in-memory topology"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        self.ensure_connected()?;
        let state = self.inner.state();
        let target = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Publish(format!("exchange {} is not declared", exchange)))?;

        let message = Message {
            payload: payload.to_vec(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            correlation_id: options.correlation_id.clone(),
            message_id: options.message_id.clone(),
        };

        // A queue bound more than once still receives one copy
        let mut routed: Vec<&str> = Vec::new();
        for (queue, pattern) in &target.bindings {
            if target.mode.routes(pattern, routing_key) && !routed.contains(&queue.as_str()) {
                if let Some(q) = state.queues.get(queue) {
                    q.push(message.clone());
                    routed.push(queue);
                }
            }
        }

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queues = routed.len(),
            "Published in-memory message"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        let source = self
            .inner
            .state()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::subscribe(queue, "queue is not declared"))?;

        // Prefetch does not apply when the broker settles on send
        let prefetch = (!options.auto_ack && options.prefetch > 0)
            .then(|| Arc::new(Semaphore::new(usize::from(options.prefetch))));

        let subscription = Subscription {
            queue: source,
            shutdown: self.inner.shutdown.clone(),
            prefetch,
            auto_ack: options.auto_ack,
        };
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Subscribed to in-memory queue");

        let stream = futures::stream::unfold(subscription, |subscription| async move {
            let delivery = subscription.next_delivery().await?;
            Some((Ok(delivery), subscription))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.shutdown.is_cancelled() {
            info!("Closing in-memory broker");
            self.inner.shutdown.cancel();
        }
        Ok(())
    }
}

struct Subscription {
    queue: Arc<MemoryQueue>,
    shutdown: CancellationToken,
    prefetch: Option<Arc<Semaphore>>,
    auto_ack: bool,
}

impl Subscription {
    /// Waits for a prefetch slot and then a message. `None` once the
    /// backend is closed.
    async fn next_delivery(&self) -> Option<Delivery> {
        let permit = match &self.prefetch {
            Some(slots) => tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                permit = slots.clone().acquire_owned() => Some(permit.ok()?),
            },
            None => None,
        };

        loop {
            let notified = self.queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(message) = self.queue.pop(self.auto_ack) {
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    message: (!self.auto_ack).then(|| message.clone()),
                    shutdown: self.shutdown.clone(),
                    _permit: permit,
                };
                return Some(Delivery::new(message, Box::new(acker)));
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}

/// Holds the unsettled message and its prefetch slot. Dropping it without
/// settling requeues the message, as a broker does for a closed channel.
struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    message: Option<Message>,
    shutdown: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        if self.message.take().is_some() {
            self.queue.settle(true);
        }
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        if let Some(message) = self.message.take() {
            if requeue {
                self.queue.requeue(message);
            } else {
                self.queue.settle(false);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.queue.requeue(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn backend_with(mode: ExchangeMode, binding: &str) -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend
            .declare(&Topology::new("events", mode, "inbox", binding))
            .await
            .unwrap();
        backend
    }

    async fn publish(backend: &MemoryBackend, key: &str, body: &str) {
        backend
            .publish("events", key, body.as_bytes(), &PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn routes_by_exchange_mode() {
        let direct = backend_with(ExchangeMode::Direct, "orders").await;
        publish(&direct, "orders", "1").await;
        publish(&direct, "orders.eu", "2").await;
        assert_eq!(direct.queue_stats("inbox").unwrap().ready, 1);

        let topic = backend_with(ExchangeMode::Topic, "orders.*").await;
        publish(&topic, "orders.eu", "1").await;
        publish(&topic, "orders", "2").await;
        assert_eq!(topic.queue_stats("inbox").unwrap().ready, 1);

        let fanout = backend_with(ExchangeMode::Fanout, "").await;
        publish(&fanout, "a", "1").await;
        publish(&fanout, "b", "2").await;
        assert_eq!(fanout.queue_stats("inbox").unwrap().ready, 2);
    }

    #[tokio::test]
    async fn redeclaring_with_other_settings_conflicts() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        backend
            .declare(&Topology::new("events", ExchangeMode::Topic, "inbox", "#"))
            .await
            .unwrap();

        let err = backend
            .declare(&Topology::new("events", ExchangeMode::Direct, "inbox", "#"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exchange events"));

        // The exchange is fine, the queue conflicts; the exchange stays declared
        let err = backend
            .declare(&Topology::new("audit", ExchangeMode::Fanout, "inbox", "").durable(false))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TopologyDeclaration { .. }));
        publish_to(&backend, "audit").await.unwrap();
    }

    async fn publish_to(backend: &MemoryBackend, exchange: &str) -> Result<()> {
        backend
            .publish(exchange, "k", b"{}", &PublishOptions::default())
            .await
    }

    #[tokio::test]
    async fn publishing_to_unknown_exchange_fails() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            publish_to(&backend, "nowhere").await,
            Err(BrokerError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn nack_requeues_at_head_and_marks_redelivered() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        publish(&backend, "a", "first").await;
        publish(&backend, "a", "second").await;

        let mut stream = backend
            .subscribe("inbox", "t", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.message().payload, b"first");
        assert!(!delivery.message().redelivered);
        delivery.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.message().payload, b"first");
        assert!(again.message().redelivered);
        again.ack().await.unwrap();

        let stats = backend.queue_stats("inbox").unwrap();
        assert_eq!(
            stats,
            QueueStats {
                ready: 1,
                unacked: 0,
                acked: 1,
                requeued: 1
            }
        );
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        publish(&backend, "a", "1").await;
        publish(&backend, "a", "2").await;

        let options = ConsumeOptions {
            auto_ack: false,
            prefetch: 1,
        };
        let mut stream = backend.subscribe("inbox", "t", options).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.message().payload, b"2");
    }

    #[tokio::test]
    async fn auto_ack_settles_on_delivery() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        publish(&backend, "a", "1").await;
        let options = ConsumeOptions {
            auto_ack: true,
            prefetch: 0,
        };
        let mut stream = backend.subscribe("inbox", "t", options).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack(true).await.unwrap();

        let stats = backend.queue_stats("inbox").unwrap();
        assert_eq!((stats.ready, stats.acked, stats.requeued), (0, 1, 0));
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        publish(&backend, "a", "1").await;
        let mut stream = backend
            .subscribe("inbox", "t", ConsumeOptions::default())
            .await
            .unwrap();
        drop(stream.next().await.unwrap().unwrap());

        let stats = backend.queue_stats("inbox").unwrap();
        assert_eq!((stats.ready, stats.unacked, stats.requeued), (1, 0, 1));
    }

    #[tokio::test]
    async fn close_ends_waiting_streams() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        let mut stream = backend
            .subscribe("inbox", "t", ConsumeOptions::default())
            .await
            .unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.close().await.unwrap();

        assert!(waiter.await.unwrap());
        assert!(!backend.is_connected());
        assert!(matches!(
            publish_to(&backend, "events").await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn waiting_stream_wakes_on_publish() {
        let backend = backend_with(ExchangeMode::Topic, "#").await;
        let mut stream = backend
            .subscribe("inbox", "t", ConsumeOptions::default())
            .await
            .unwrap();
        let waiter = tokio::spawn(async move {
            let delivery = stream.next().await.unwrap().unwrap();
            delivery.message().payload.clone()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&backend, "late", "hello").await;
        assert_eq!(waiter.await.unwrap(), b"hello");
    }
}
