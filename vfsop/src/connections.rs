use std::sync::Arc;

use common::{ConnectionKey, ConnectionsFile, Error};
use pool::{ConnectionHandle, ConnectionRegistry, StoreFactories};

/// Configured connections of one deployment plus the registry of live handles.
///
/// Handles are created lazily on first checkout and then pooled until [`Connections::shutdown`].
#[derive(Debug)]
pub struct Connections {
    config: ConnectionsFile,
    factories: StoreFactories,
    registry: ConnectionRegistry,
}

impl Connections {
    pub fn new(config: ConnectionsFile, factories: StoreFactories) -> Self {
        Self {
            config,
            factories,
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Live handle for `key`, connecting from configuration on first use.
    pub fn checkout(&self, key: &ConnectionKey) -> Result<Arc<ConnectionHandle>, Error> {
        if self.registry.exists(key) {
            return self.registry.get(key);
        }
        match self.config.find(&key.namespace, &key.name) {
            Some(config) => self.registry.connect(config, &self.factories),
            None => Err(Error::ConnectionNotFound { key: key.clone() }),
        }
    }

    /// Hands a checked out handle back, undoing per-operation option overrides.
    pub fn checkin(&self, key: &ConnectionKey, handle: Arc<ConnectionHandle>) {
        self.registry.return_handle(key, handle);
    }

    /// Closes and forgets every live handle of `namespace`.
    pub async fn shutdown(&self, namespace: &str) -> usize {
        self.registry.shutdown(namespace).await
    }
}
