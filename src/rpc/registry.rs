use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::channel::RpcChannel;
use super::errors::{BoxError, RegistryError};

type Factory<C> = Arc<dyn Fn(RpcChannel) -> Result<C, BoxError> + Send + Sync>;

/// Maps a service name to the function that turns its channel into a typed client.
///
/// `C` is the caller's client type, usually an enum with one variant per
/// backend service so lookups stay checked at compile time.
pub struct ClientRegistry<C> {
    factories: RwLock<HashMap<String, Factory<C>>>,
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Store the factory for `name`, replacing any earlier one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(RpcChannel) -> Result<C, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut guard = self
            .factories
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?;

        if guard.insert(name.clone(), Arc::new(factory)).is_some() {
            debug!(service = %name, "Replaced client factory");
        } else {
            debug!(service = %name, "Registered client factory");
        }
        Ok(())
    }

    /// Build a client for `name` from an established channel.
    pub fn create_client(&self, name: &str, channel: RpcChannel) -> Result<C, RegistryError> {
        // Clone the factory out so it runs without holding the lock
        let factory = {
            let guard = self
                .factories
                .read()
                .map_err(|_| RegistryError::LockPoisoned)?;
            guard
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::FactoryNotFound(name.to_string()))?
        };

        factory(channel).map_err(|source| RegistryError::Factory {
            service: name.to_string(),
            source,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .map(|guard| guard.contains_key(name))
            .unwrap_or(false)
    }
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::channel::testing::echo_channel;

    #[derive(Debug, Clone, PartialEq)]
    enum TestClient {
        Users(String),
        Orders(String),
    }

    #[test]
    fn create_client_uses_registered_factory() {
        let registry = ClientRegistry::new();
        registry
            .register("users", |ch: RpcChannel| {
                Ok(TestClient::Users(ch.service().to_string()))
            })
            .unwrap();

        let client = registry
            .create_client("users", echo_channel("users"))
            .unwrap();
        assert_eq!(client, TestClient::Users("users".to_string()));
    }

    #[test]
    fn unknown_service_is_factory_not_found() {
        let registry: ClientRegistry<TestClient> = ClientRegistry::new();
        let err = registry
            .create_client("missing", echo_channel("missing"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::FactoryNotFound(name) if name == "missing"));
    }

    #[test]
    fn later_registration_overwrites() {
        let registry = ClientRegistry::new();
        registry
            .register("svc", |_| Ok(TestClient::Users("first".into())))
            .unwrap();
        registry
            .register("svc", |_| Ok(TestClient::Orders("second".into())))
            .unwrap();

        let client = registry.create_client("svc", echo_channel("svc")).unwrap();
        assert_eq!(client, TestClient::Orders("second".into()));
    }

    #[test]
    fn factory_error_carries_service_name() {
        let registry: ClientRegistry<TestClient> = ClientRegistry::new();
        registry
            .register("broken", |_| Err("no luck".into()))
            .unwrap();

        match registry.create_client("broken", echo_channel("broken")) {
            Err(RegistryError::Factory { service, source }) => {
                assert_eq!(service, "broken");
                assert_eq!(source.to_string(), "no luck");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
