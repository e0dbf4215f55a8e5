use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::{ConsumeOptions, Delivery, DeliveryStream, Message};
use super::errors::{BrokerError, Result};
use super::BrokerShared;
use crate::correlation::{with_correlation_id, CorrelationId};
use crate::BoxError;

/// Processes one consumed message. An `Err` requeues the message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: CancellationToken,
        message: Message,
    ) -> std::result::Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: CancellationToken,
        message: Message,
    ) -> std::result::Result<(), BoxError> {
        (self)(ctx, message).await
    }
}

/// Subscribes handlers to the declared queue.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<BrokerShared>,
}

impl Consumer {
    pub(crate) fn new(shared: Arc<BrokerShared>) -> Self {
        Self { shared }
    }

    /// Consume with manual acknowledgement and no prefetch bound.
    pub async fn consume<H>(&self, ctx: CancellationToken, handler: H) -> Result<ConsumerHandle>
    where
        H: MessageHandler,
    {
        self.consume_with_options(ctx, handler, ConsumeOptions::default())
            .await
    }

    /// Subscribe and start the receive loop in the background.
    ///
    /// Only subscription errors are returned. Deliveries are handled one at a
    /// time: success acks, failure nacks with requeue. The loop stops when
    /// `ctx` is cancelled, without waiting for a handler already running; use
    /// [`ConsumerHandle::drain`] to wait for it.
    pub async fn consume_with_options<H>(
        &self,
        ctx: CancellationToken,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle>
    where
        H: MessageHandler,
    {
        let backend = &self.shared.backend;
        if !backend.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let queue = self.shared.topology.queue.clone();
        let tag = format!("servicelink-{}", Uuid::new_v4());
        let stream = backend.subscribe(&queue, &tag, options).await?;

        info!(
            queue = %queue,
            consumer_tag = %tag,
            auto_ack = options.auto_ack,
            prefetch = options.prefetch,
            "Started consuming"
        );

        let tracker = TaskTracker::new();
        let task = tokio::spawn(receive_loop(
            ctx,
            stream,
            Arc::new(handler),
            options.auto_ack,
            tracker.clone(),
            tag.clone(),
        ));

        Ok(ConsumerHandle { tag, task, tracker })
    }
}

async fn receive_loop<H: MessageHandler>(
    ctx: CancellationToken,
    mut stream: DeliveryStream,
    handler: Arc<H>,
    auto_ack: bool,
    tracker: TaskTracker,
    tag: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            next = stream.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(consumer_tag = %tag, error = %e, "Error receiving message");
                break;
            }
            None => {
                info!(consumer_tag = %tag, "Delivery stream ended");
                break;
            }
        };

        let in_flight = tracker.spawn(process_delivery(
            ctx.clone(),
            handler.clone(),
            delivery,
            auto_ack,
        ));

        // Serial processing; cancellation abandons the wait, not the handler
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            joined = in_flight => {
                if let Err(e) = joined {
                    error!(consumer_tag = %tag, error = %e, "Message handler task failed");
                }
            }
        }
    }

    info!(consumer_tag = %tag, "Consumer stopped");
}

async fn process_delivery<H: MessageHandler>(
    ctx: CancellationToken,
    handler: Arc<H>,
    delivery: Delivery,
    auto_ack: bool,
) {
    let (message, acker) = delivery.into_parts();
    let routing_key = message.routing_key.clone();
    let correlation = message
        .correlation_id
        .clone()
        .map(CorrelationId::new)
        .unwrap_or_else(CorrelationId::generate);

    debug!(
        routing_key = %routing_key,
        redelivered = message.redelivered,
        correlation_id = %correlation,
        "Received message"
    );

    let outcome = with_correlation_id(correlation, handler.handle(ctx, message)).await;

    if auto_ack {
        if let Err(e) = outcome {
            error!(routing_key = %routing_key, error = %e, "Handler failed on auto-acked message");
        }
        return;
    }

    match outcome {
        Ok(()) => {
            if let Err(e) = acker.ack().await {
                error!(routing_key = %routing_key, error = %e, "Failed to acknowledge message");
            }
        }
        Err(e) => {
            warn!(routing_key = %routing_key, error = %e, "Handler failed, requeueing message");
            if let Err(e) = acker.nack(true).await {
                error!(
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to negatively acknowledge message"
                );
            }
        }
    }
}

/// Running consumer.
pub struct ConsumerHandle {
    tag: String,
    task: JoinHandle<()>,
    tracker: TaskTracker,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    /// True once the receive loop has stopped. A handler may still be running.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the receive loop to stop and for any handler it started to
    /// settle its message. Only returns after the consume context is
    /// cancelled or the delivery stream ends.
    pub async fn drain(self) {
        if let Err(e) = self.task.await {
            error!(consumer_tag = %self.tag, error = %e, "Receive loop failed");
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!(consumer_tag = %self.tag, "Consumer drained");
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("tag", &self.tag)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
