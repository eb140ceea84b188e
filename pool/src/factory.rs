use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use common::{BackingStore, ConnectionConfig, Error, LocalStore, Protocol};

use crate::handle::ConnectionHandle;
use crate::registry::ConnectionRegistry;
use crate::suspension::SuspensionConfig;

/// Builds backing stores for one protocol. Remote protocols are provided by the embedding
/// application; only the local-disk factory ships with this crate.
pub trait StoreFactory: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn create(&self, config: &ConnectionConfig) -> anyhow::Result<Arc<dyn BackingStore>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStoreFactory;

impl StoreFactory for LocalStoreFactory {
    fn protocol(&self) -> Protocol {
        Protocol::File
    }

    fn create(&self, config: &ConnectionConfig) -> anyhow::Result<Arc<dyn BackingStore>> {
        if !config.working_dir.is_absolute() {
            return Err(anyhow!(
                "working_dir {:?} of local connection {} must be absolute",
                &config.working_dir,
                &config.name
            ));
        }
        Ok(Arc::new(LocalStore::new()))
    }
}

#[derive(Clone)]
pub struct StoreFactories {
    factories: HashMap<Protocol, Arc<dyn StoreFactory>>,
}

impl std::fmt::Debug for StoreFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<_> = self.factories.keys().map(ToString::to_string).collect();
        protocols.sort();
        f.debug_struct("StoreFactories")
            .field("protocols", &protocols)
            .finish()
    }
}

impl Default for StoreFactories {
    /// Factories for the protocols this crate implements itself (local disk).
    fn default() -> Self {
        let mut factories = Self::empty();
        factories.register(Arc::new(LocalStoreFactory));
        factories
    }
}

impl StoreFactories {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Adds or replaces the factory for `factory.protocol()`.
    pub fn register(&mut self, factory: Arc<dyn StoreFactory>) {
        self.factories.insert(factory.protocol(), factory);
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn StoreFactory>> {
        self.factories.get(&protocol)
    }
}

/// Builds a connection handle from configuration.
pub fn connect(
    config: &ConnectionConfig,
    factories: &StoreFactories,
) -> Result<ConnectionHandle, Error> {
    config.validate().map_err(Error::InvalidConfig)?;
    let factory = factories
        .get(config.protocol)
        .ok_or_else(|| Error::UnsupportedProtocol(config.protocol.to_string()))?;
    let store = factory
        .create(config)
        .map_err(|source| Error::ConnectionError {
            connection: config.name.clone(),
            source,
        })?;
    tracing::debug!(
        "created connection {} to {}",
        config.key(),
        store.describe()
    );
    Ok(ConnectionHandle::new(
        config.key(),
        store,
        config.working_dir.clone(),
        config.access_options(),
        SuspensionConfig::from(config),
    )
    .with_lock_config(config.lock.clone()))
}

impl ConnectionRegistry {
    /// Handle for `config`, created on first use.
    pub fn connect(
        &self,
        config: &ConnectionConfig,
        factories: &StoreFactories,
    ) -> Result<Arc<ConnectionHandle>, Error> {
        self.get_or_create(&config.key(), || connect(config, factories))
    }
}
