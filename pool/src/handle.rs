use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use common::{AccessOptions, BackingStore, ConnectionKey, Error, FileHandle, LockConfig};
use tracing::instrument;

use crate::suspension::{FailureOutcome, Health, SuspensionConfig, SuspensionPolicy};

/// One configured backend connection shared by every operation that names it.
///
/// The handle owns the backing store for its whole lifetime; leases and in-flight operations
/// borrow it through [`ConnectionHandle::store`]. Access options are shared as well: an
/// operation that widens them for a single call must put them back through
/// [`crate::ConnectionRegistry::return_handle`].
#[derive(Debug)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    store: Arc<dyn BackingStore>,
    base_dir: PathBuf,
    default_options: AccessOptions,
    options: parking_lot::RwLock<AccessOptions>,
    options_modified: AtomicBool,
    suspension: SuspensionPolicy,
    lock: LockConfig,
}

impl ConnectionHandle {
    pub fn new(
        key: ConnectionKey,
        store: Arc<dyn BackingStore>,
        base_dir: impl Into<PathBuf>,
        options: AccessOptions,
        suspension: SuspensionConfig,
    ) -> Self {
        Self {
            key,
            store,
            base_dir: base_dir.into(),
            options: parking_lot::RwLock::new(options.clone()),
            default_options: options,
            options_modified: AtomicBool::new(false),
            suspension: SuspensionPolicy::new(suspension),
            lock: LockConfig::default(),
        }
    }

    #[must_use]
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn lock_config(&self) -> &LockConfig {
        &self.lock
    }

    pub fn store(&self) -> Arc<dyn BackingStore> {
        self.store.clone()
    }

    pub fn options(&self) -> AccessOptions {
        self.options.read().clone()
    }

    /// Mutates the shared options; the registry restores them when the handle is returned.
    pub fn override_options(&self, update: impl FnOnce(&mut AccessOptions)) {
        let mut options = self.options.write();
        update(&mut options);
        self.options_modified
            .store(*options != self.default_options, Ordering::Release);
    }

    /// Puts the configured options back. Returns `true` if anything had to be restored.
    pub fn restore_options(&self) -> bool {
        let mut options = self.options.write();
        if !self.options_modified.swap(false, Ordering::AcqRel) {
            return false;
        }
        *options = self.default_options.clone();
        true
    }

    pub fn options_modified(&self) -> bool {
        self.options_modified.load(Ordering::Acquire)
    }

    pub fn health(&self) -> Health {
        self.suspension.health()
    }

    /// Absolute location of `path` on the backend; relative paths hang off the base directory.
    pub fn path_for(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    /// Resolves `path` on the backend unless the connection is suspended.
    ///
    /// While suspended this returns [`Error::ConnectionSuspended`] without touching the
    /// backend. Backend failures are counted towards suspension and come back as
    /// [`Error::ConnectionError`].
    #[instrument(skip(self), fields(connection = %self.key))]
    pub async fn resolve_with_suspension(&self, path: &Path) -> Result<FileHandle, Error> {
        if let Err(remaining) = self.suspension.admit() {
            tracing::debug!("rejected, suspended for another {:?}", remaining);
            return Err(Error::ConnectionSuspended {
                connection: self.key.name.clone(),
                remaining,
            });
        }
        let full_path = self.path_for(path);
        let options = self.options();
        match self.store.resolve(&full_path, &options).await {
            Ok(file) => {
                if self.suspension.record_success() {
                    tracing::info!("connection {} recovered", &self.key);
                }
                Ok(file)
            }
            Err(error) => {
                match self.suspension.record_failure() {
                    FailureOutcome::Suspended {
                        failure_count,
                        backoff,
                    } => tracing::warn!(
                        "connection {} suspended for {:?} after {} consecutive failures",
                        &self.key,
                        backoff,
                        failure_count
                    ),
                    FailureOutcome::Counted { failure_count } => tracing::debug!(
                        "resolve failed ({} consecutive failures): {:#}",
                        failure_count,
                        &error
                    ),
                }
                Err(Error::ConnectionError {
                    connection: self.key.name.clone(),
                    source: error.context(format!(
                        "failed resolving {:?} on {}",
                        &full_path,
                        self.store.describe()
                    )),
                })
            }
        }
    }

    /// Closes the backing store. The handle must not be used afterwards.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.store
            .close()
            .await
            .with_context(|| format!("failed closing connection {}", &self.key))
    }
}
