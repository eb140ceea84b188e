//! File operations over pooled connections
//!
//! Every operation follows the same contract: check the handle out of [`Connections`], take
//! a lease if the write is locked, do the I/O, and check the handle back in whatever the
//! result was.

use std::path::Path;

use common::{ConnectionKey, Error, FileHandle, LockConfig, LockScheme};
use lease::LeaseLock;
use pool::ConnectionHandle;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::connections::Connections;

#[derive(Debug, Clone, Default)]
pub struct WriteSettings {
    /// Append to an existing file instead of replacing it
    pub append: bool,
    /// Overrides the connection's lock configuration for this write
    pub lock: Option<LockConfig>,
}

async fn with_handle<T>(
    connections: &Connections,
    key: &ConnectionKey,
    op: impl AsyncFnOnce(&ConnectionHandle) -> Result<T, Error>,
) -> Result<T, Error> {
    let handle = connections.checkout(key)?;
    let result = op(handle.as_ref()).await;
    connections.checkin(key, handle);
    result
}

#[instrument(skip(connections), fields(connection = %key))]
pub async fn exists(
    connections: &Connections,
    key: &ConnectionKey,
    path: &Path,
) -> Result<bool, Error> {
    with_handle(connections, key, async |handle| {
        let file = handle.resolve_with_suspension(path).await?;
        handle
            .store()
            .exists(&file)
            .await
            .map_err(|source| Error::filesystem(file.path(), source))
    })
    .await
}

/// Streams the file at `path` into `sink`, returning the number of bytes copied.
#[instrument(skip(connections, sink), fields(connection = %key))]
pub async fn read<W>(
    connections: &Connections,
    key: &ConnectionKey,
    path: &Path,
    sink: &mut W,
) -> Result<u64, Error>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    with_handle(connections, key, async |handle| {
        let file = handle.resolve_with_suspension(path).await?;
        let copied = async {
            let mut reader = handle.store().open_read(&file).await?;
            let copied = tokio::io::copy(&mut reader, &mut *sink).await?;
            sink.flush().await?;
            anyhow::Ok(copied)
        }
        .await;
        copied.map_err(|source| Error::filesystem(file.path(), source))
    })
    .await
}

/// Streams `source` into the file at `path`, returning the number of bytes written.
///
/// With a marker lock the write only starts once the lease is held; a writer that finds the
/// marker taken fails with [`Error::LockAcquisitionFailed`] without touching the file.
#[instrument(skip(connections, source, settings), fields(connection = %key))]
pub async fn write<R>(
    connections: &Connections,
    key: &ConnectionKey,
    path: &Path,
    source: &mut R,
    settings: &WriteSettings,
) -> Result<u64, Error>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    with_handle(connections, key, async |handle| {
        let file = handle.resolve_with_suspension(path).await?;
        let lock = settings
            .lock
            .clone()
            .unwrap_or_else(|| handle.lock_config().clone());
        let lease = match lock.scheme {
            LockScheme::None => None,
            LockScheme::Marker => Some(take_lease(handle, &file, &lock).await?),
        };
        let written = copy_into(handle, &file, &mut *source, settings.append).await;
        if let Some(lease) = lease {
            match lease.release().await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    "lease on {:?} expired before the write finished",
                    file.path()
                ),
                Err(error) if written.is_ok() => return Err(error),
                Err(error) => tracing::warn!("{:#}", &error),
            }
        }
        written.map_err(|source| Error::filesystem(file.path(), source))
    })
    .await
}

async fn take_lease(
    handle: &ConnectionHandle,
    file: &FileHandle,
    lock: &LockConfig,
) -> Result<LeaseLock, Error> {
    let lease = LeaseLock::new(file.path())?;
    if !lease
        .acquire(handle.store(), &handle.options(), lock.expiry)
        .await?
    {
        return Err(Error::LockAcquisitionFailed {
            path: lease.marker_path().to_path_buf(),
            reason: "held by another writer".to_string(),
        });
    }
    Ok(lease)
}

async fn copy_into<R>(
    handle: &ConnectionHandle,
    file: &FileHandle,
    source: &mut R,
    append: bool,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut writer = handle.store().open_write(file, append).await?;
    let written = tokio::io::copy(source, &mut writer).await?;
    writer.shutdown().await?;
    Ok(written)
}

#[instrument(skip(connections), fields(connection = %key))]
pub async fn delete(
    connections: &Connections,
    key: &ConnectionKey,
    path: &Path,
) -> Result<bool, Error> {
    with_handle(connections, key, async |handle| {
        let file = handle.resolve_with_suspension(path).await?;
        handle
            .store()
            .delete(&file)
            .await
            .map_err(|source| Error::filesystem(file.path(), source))
    })
    .await
}
