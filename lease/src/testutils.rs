use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{AccessOptions, BackingStore, FileHandle, LocalStore, ReadStream, WriteStream};

/// Local disk without exclusive create, with optional injected failures.
#[derive(Debug, Default)]
pub struct TestStore {
    inner: LocalStore,
    failing_deletes: AtomicUsize,
    fail_write: bool,
    delete_calls: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` deletes.
    pub fn failing_deletes(self, count: usize) -> Self {
        self.failing_deletes.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_write(mut self) -> Self {
        self.fail_write = true;
        self
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BackingStore for TestStore {
    fn describe(&self) -> String {
        "test://".to_string()
    }

    async fn resolve(&self, path: &Path, options: &AccessOptions) -> anyhow::Result<FileHandle> {
        self.inner.resolve(path, options).await
    }

    async fn exists(&self, file: &FileHandle) -> anyhow::Result<bool> {
        // widen the check-then-create window so racing writers overlap
        tokio::task::yield_now().await;
        self.inner.exists(file).await
    }

    async fn create_file(&self, file: &FileHandle) -> anyhow::Result<()> {
        self.inner.create_file(file).await
    }

    async fn delete(&self, file: &FileHandle) -> anyhow::Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("permission denied removing {:?}", file.path()));
        }
        self.inner.delete(file).await
    }

    async fn open_read(&self, file: &FileHandle) -> anyhow::Result<ReadStream> {
        self.inner.open_read(file).await
    }

    async fn open_write(&self, file: &FileHandle, append: bool) -> anyhow::Result<WriteStream> {
        if self.fail_write {
            return Err(anyhow::anyhow!("disk full writing {:?}", file.path()));
        }
        self.inner.open_write(file, append).await
    }
}
