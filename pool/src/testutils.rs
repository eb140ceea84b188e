use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::anyhow;
use common::{AccessOptions, BackingStore, FileHandle, ReadStream, WriteStream};

/// Store whose reachability is flipped by the test; counts resolve calls.
#[derive(Debug)]
pub struct ScriptedStore {
    reachable: AtomicBool,
    resolve_calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedStore {
    pub fn reachable() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            resolve_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn unreachable() -> Self {
        let store = Self::reachable();
        store.set_reachable(false);
        store
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BackingStore for ScriptedStore {
    fn describe(&self) -> String {
        "scripted://".to_string()
    }

    async fn resolve(&self, path: &Path, _options: &AccessOptions) -> anyhow::Result<FileHandle> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(FileHandle::new(path))
        } else {
            Err(anyhow!("connection refused"))
        }
    }

    async fn exists(&self, _file: &FileHandle) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn create_file(&self, _file: &FileHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete(&self, _file: &FileHandle) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn open_read(&self, _file: &FileHandle) -> anyhow::Result<ReadStream> {
        Ok(Box::new(tokio::io::empty()))
    }

    async fn open_write(&self, _file: &FileHandle, _append: bool) -> anyhow::Result<WriteStream> {
        Ok(Box::new(tokio::io::sink()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
