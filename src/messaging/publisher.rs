use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use super::backend::PublishOptions;
use super::errors::{BrokerError, Result};
use super::BrokerShared;
use crate::correlation::current_correlation_id;

/// Sends payloads to the declared exchange.
///
/// Clones share the broker handle, and all of them publish through the same
/// lock, so concurrent callers never interleave writes on the channel.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<BrokerShared>,
}

impl Publisher {
    pub(crate) fn new(shared: Arc<BrokerShared>) -> Self {
        Self { shared }
    }

    /// Publish with the topology's binding as routing key.
    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        self.publish_with_options(None, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with_routing(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_options(Some(routing_key), payload, PublishOptions::default())
            .await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        routing_key: Option<&str>,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_with_options(routing_key, &payload, PublishOptions::default())
            .await
    }

    /// Publish with explicit options. Unset message id, timestamp and
    /// correlation id are filled in; the correlation id comes from the
    /// ambient scope when there is one.
    pub async fn publish_with_options(
        &self,
        routing_key: Option<&str>,
        payload: &[u8],
        mut options: PublishOptions,
    ) -> Result<()> {
        let backend = &self.shared.backend;
        if !backend.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let topology = &self.shared.topology;
        let routing_key = routing_key.unwrap_or(&topology.binding);

        if options.correlation_id.is_none() {
            options.correlation_id = current_correlation_id().map(String::from);
        }
        options
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());
        options
            .timestamp
            .get_or_insert_with(|| chrono::Utc::now().timestamp().max(0) as u64);

        let _guard = self.shared.publish_lock.lock().await;
        backend
            .publish(&topology.exchange, routing_key, payload, &options)
            .await
            .map_err(|e| {
                error!(
                    exchange = %topology.exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "Publish failed"
                );
                e
            })?;

        debug!(
            exchange = %topology.exchange,
            routing_key = %routing_key,
            bytes = payload.len(),
            message_id = options.message_id.as_deref().unwrap_or_default(),
            "Message published"
        );
        Ok(())
    }
}
