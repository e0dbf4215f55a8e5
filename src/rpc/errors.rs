// src/rpc/errors.rs

use thiserror::Error;

/// Boxed error used at the tower/transport boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid service config: {0}")]
    InvalidConfig(String),

    #[error("Service not registered: {0}")]
    ServiceNotRegistered(String),

    #[error("No connection for service: {0}")]
    ConnectionNotFound(String),

    #[error("Failed to dial service {service}: {source}")]
    DialFailure {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("No client factory registered for service: {0}")]
    FactoryNotFound(String),

    #[error("Client factory for service {service} failed: {source}")]
    ClientCreation {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to close {failed} of {total} connections")]
    CloseFailure { failed: usize, total: usize },

    #[error("Connection state lock poisoned")]
    LockPoisoned,
}

// Custom Result type for connection manager operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No client factory registered for service: {0}")]
    FactoryNotFound(String),

    #[error("Client factory for service {service} failed: {source}")]
    Factory {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

impl From<RegistryError> for ConnectionError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::FactoryNotFound(name) => ConnectionError::FactoryNotFound(name),
            RegistryError::Factory { service, source } => {
                ConnectionError::ClientCreation { service, source }
            }
            RegistryError::LockPoisoned => ConnectionError::LockPoisoned,
        }
    }
}

/// Returned by calls made through a channel after it was closed.
#[derive(Debug, Error)]
#[error("Channel to service {service} is closed")]
pub struct ChannelClosed {
    pub service: String,
}
