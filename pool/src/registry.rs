use std::collections::HashMap;
use std::sync::Arc;

use common::{ConnectionKey, Error};
use tracing::instrument;

use crate::handle::ConnectionHandle;

/// Table of live connections, one handle per [`ConnectionKey`].
///
/// The hosting platform builds one registry at startup, passes it to every operation and
/// calls [`ConnectionRegistry::shutdown`] for a namespace when that namespace is undeployed.
/// Handles are not pooled per caller: concurrent operations on the same key share one
/// handle.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: parking_lot::RwLock<HashMap<ConnectionKey, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, key: &ConnectionKey) -> bool {
        self.handles.read().contains_key(key)
    }

    /// Registers `handle` under its key unless one is registered already, in which case the
    /// existing handle wins and `handle` is closed in the background. Returns the registered
    /// handle.
    pub fn create(&self, handle: ConnectionHandle) -> Arc<ConnectionHandle> {
        let mut handles = self.handles.write();
        if let Some(existing) = handles.get(handle.key()) {
            let existing = existing.clone();
            drop(handles);
            tracing::debug!(
                "connection {} already registered, keeping existing handle",
                handle.key()
            );
            discard(handle);
            return existing;
        }
        let key = handle.key().clone();
        let handle = Arc::new(handle);
        handles.insert(key, handle.clone());
        handle
    }

    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<ConnectionHandle>, Error> {
        self.handles
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound { key: key.clone() })
    }

    /// Returns the handle for `key`, building it with `make` on first use.
    ///
    /// `make` runs under the registry's write lock, so concurrent callers build at most one
    /// handle per key. It must not call back into the registry.
    pub fn get_or_create(
        &self,
        key: &ConnectionKey,
        make: impl FnOnce() -> Result<ConnectionHandle, Error>,
    ) -> Result<Arc<ConnectionHandle>, Error> {
        if let Ok(handle) = self.get(key) {
            return Ok(handle);
        }
        let mut handles = self.handles.write();
        if let Some(existing) = handles.get(key) {
            return Ok(existing.clone());
        }
        let handle = make()?;
        if handle.key() != key {
            drop(handles);
            let error = Error::InvalidConfig(format!(
                "connection built for {} was requested as {}",
                handle.key(),
                key
            ));
            discard(handle);
            return Err(error);
        }
        let handle = Arc::new(handle);
        handles.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Whether the handle registered for `key` carries state an operation changed and
    /// [`ConnectionRegistry::return_handle`] has to undo.
    pub fn status_of(&self, key: &ConnectionKey) -> bool {
        self.handles
            .read()
            .get(key)
            .is_some_and(|handle| handle.options_modified())
    }

    /// Called by an operation once it is done with `handle`.
    pub fn return_handle(&self, key: &ConnectionKey, handle: Arc<ConnectionHandle>) {
        let registered = self
            .handles
            .read()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &handle));
        if !registered {
            tracing::debug!(
                "connection {} returned after it was shut down or replaced",
                key
            );
        }
        if handle.restore_options() {
            tracing::trace!("restored access options of connection {}", key);
        }
    }

    pub fn keys(&self, namespace: &str) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self
            .handles
            .read()
            .keys()
            .filter(|key| key.namespace == namespace)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Evicts and closes every connection of `namespace`. Returns how many were closed.
    ///
    /// Close failures are logged; they never keep a connection registered.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, namespace: &str) -> usize {
        let evicted: Vec<Arc<ConnectionHandle>> = {
            let mut handles = self.handles.write();
            let keys: Vec<_> = handles
                .keys()
                .filter(|key| key.namespace == namespace)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| handles.remove(key)).collect()
        };
        for handle in &evicted {
            match handle.close().await {
                Ok(()) => tracing::debug!("closed connection {}", handle.key()),
                Err(error) => tracing::warn!("{:#}", &error),
            }
        }
        tracing::info!(
            "shut down {} connection(s) of namespace {}",
            evicted.len(),
            namespace
        );
        evicted.len()
    }
}

/// Closes a handle that never made it into the registry.
fn discard(handle: ConnectionHandle) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(error) = handle.close().await {
                    tracing::warn!("{:#}", &error);
                }
            });
        }
        Err(_) => tracing::warn!(
            "connection {} discarded outside of a tokio runtime, its store is not closed",
            handle.key()
        ),
    }
}
