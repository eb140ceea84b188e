//! Backing-store abstraction
//!
//! A [`BackingStore`] is the capability set the connection layer needs from one configured
//! backend filesystem (local disk, FTP, FTPS, SFTP, ...). Wire protocols live behind this
//! trait; the connection registry, the suspension policy and the lease lock only ever talk
//! to a store through it.
//!
//! Stores are shared by every caller using the same connection and must tolerate
//! concurrent use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type ReadStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;
pub type WriteStream = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// Protocol-specific options (passive mode, host-key checking, TLS material, timeouts, ...)
/// assembled by the configuration layer and handed to the store untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AccessOptions {
    entries: BTreeMap<String, String>,
}

impl AccessOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, String>> for AccessOptions {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

/// A path that the store has resolved and can operate on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHandle {
    path: PathBuf,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Identity of the backend, e.g. `file://` or `sftp://user@host:22`. Two stores with the
    /// same identity reach the same files.
    fn describe(&self) -> String;

    async fn resolve(&self, path: &Path, options: &AccessOptions) -> anyhow::Result<FileHandle>;

    async fn exists(&self, file: &FileHandle) -> anyhow::Result<bool>;

    /// Creates an empty file, truncating it if present.
    async fn create_file(&self, file: &FileHandle) -> anyhow::Result<()>;

    /// Whether [`BackingStore::create_exclusive`] is available on this backend.
    fn supports_exclusive_create(&self) -> bool {
        false
    }

    /// Creates the file only if it does not exist yet. Returns `false` if it already existed.
    async fn create_exclusive(&self, file: &FileHandle) -> anyhow::Result<bool> {
        Err(anyhow::anyhow!(
            "{} does not support exclusive create of {:?}",
            self.describe(),
            file.path()
        ))
    }

    /// Removes the file. Returns `false` if there was nothing to remove.
    async fn delete(&self, file: &FileHandle) -> anyhow::Result<bool>;

    async fn open_read(&self, file: &FileHandle) -> anyhow::Result<ReadStream>;

    async fn open_write(&self, file: &FileHandle, append: bool) -> anyhow::Result<WriteStream>;

    /// Releases backend sessions. Called once when the owning connection is shut down.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
