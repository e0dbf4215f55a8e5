// src/messaging/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Topology declaration failed for {entity}: {reason}")]
    TopologyDeclaration { entity: String, reason: String },

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe to queue {queue} failed: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Broker close failed: {0}")]
    Close(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    pub(crate) fn topology(entity: impl Into<String>, reason: impl ToString) -> Self {
        BrokerError::TopologyDeclaration {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscribe(queue: impl Into<String>, reason: impl ToString) -> Self {
        BrokerError::Subscribe {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidConnectionState(_) | LapinError::InvalidChannelState(_) => {
                BrokerError::NotConnected
            }
            other => BrokerError::Connection(other.to_string()),
        }
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_: Elapsed) -> Self {
        BrokerError::Timeout
    }
}
