use anyhow::{Context, anyhow};
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

use crate::store::{AccessOptions, BackingStore, FileHandle, ReadStream, WriteStream};

/// Local disk backend built on `tokio::fs`.
///
/// Resolving a path requires its parent directory to be present, so a missing or unmounted
/// working directory shows up as a resolve failure and feeds the suspension policy just like
/// an unreachable remote host would.
#[derive(Debug, Default, Clone)]
pub struct LocalStore {}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

fn normalize(path: &Path) -> anyhow::Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(anyhow!("path {:?} escapes the filesystem root", path));
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.file_name().is_none() {
        return Err(anyhow!("path {:?} does not name a file", path));
    }
    Ok(normalized)
}

#[async_trait::async_trait]
impl BackingStore for LocalStore {
    fn describe(&self) -> String {
        "file://".to_string()
    }

    #[instrument(skip(self, _options))]
    async fn resolve(&self, path: &Path, _options: &AccessOptions) -> anyhow::Result<FileHandle> {
        if !path.is_absolute() {
            return Err(anyhow!("local path {:?} must be absolute", path));
        }
        let path = normalize(path)?;
        let parent = path
            .parent()
            .with_context(|| format!("path {:?} has no parent directory", &path))?;
        let parent_metadata = tokio::fs::metadata(parent)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", parent))?;
        if !parent_metadata.is_dir() {
            return Err(anyhow!("{:?} is not a directory", parent));
        }
        Ok(FileHandle::new(path))
    }

    async fn exists(&self, file: &FileHandle) -> anyhow::Result<bool> {
        tokio::fs::try_exists(file.path())
            .await
            .with_context(|| format!("failed checking existence of {:?}", file.path()))
    }

    async fn create_file(&self, file: &FileHandle) -> anyhow::Result<()> {
        tokio::fs::File::create(file.path())
            .await
            .with_context(|| format!("failed creating {:?}", file.path()))?;
        Ok(())
    }

    fn supports_exclusive_create(&self) -> bool {
        true
    }

    async fn create_exclusive(&self, file: &FileHandle) -> anyhow::Result<bool> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(file.path())
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(anyhow::Error::from(error)
                .context(format!("failed exclusively creating {:?}", file.path()))),
        }
    }

    async fn delete(&self, file: &FileHandle) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(file.path()).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => {
                Err(anyhow::Error::from(error).context(format!("failed removing {:?}", file.path())))
            }
        }
    }

    async fn open_read(&self, file: &FileHandle) -> anyhow::Result<ReadStream> {
        let reader = tokio::fs::File::open(file.path())
            .await
            .with_context(|| format!("cannot open {:?} for reading", file.path()))?;
        Ok(Box::new(reader))
    }

    async fn open_write(&self, file: &FileHandle, append: bool) -> anyhow::Result<WriteStream> {
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let writer = options
            .open(file.path())
            .await
            .with_context(|| format!("cannot open {:?} for writing", file.path()))?;
        Ok(Box::new(writer))
    }
}
