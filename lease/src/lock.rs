use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use common::{AccessOptions, BackingStore, Error, FileHandle};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::diagnostics::Diagnostics;
use crate::path_lock;

/// Number of times a lease tries to remove its marker, on release or expiry, before giving up.
pub const MARKER_REMOVAL_ATTEMPTS: usize = 3;

const IDLE: u8 = 0;
const ACQUIRING: u8 = 1;
const ACTIVE: u8 = 2;
const RELEASED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Not acquired yet, or the last acquisition attempt lost.
    Idle,
    Acquiring,
    Active,
    /// Released explicitly or by expiry. Terminal.
    Released,
}

impl LeaseState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => LeaseState::Idle,
            ACQUIRING => LeaseState::Acquiring,
            ACTIVE => LeaseState::Active,
            _ => LeaseState::Released,
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            LeaseState::Idle => "idle",
            LeaseState::Acquiring => "acquiring",
            LeaseState::Active => "active",
            LeaseState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Marker path for `target`: the same directory, file name with `.lock` appended.
#[must_use]
pub fn marker_path_for(target: &Path) -> Option<PathBuf> {
    let name = target.file_name()?;
    let mut marker = name.to_os_string();
    marker.push(".lock");
    Some(target.with_file_name(marker))
}

#[derive(Debug)]
struct Held {
    store: Arc<dyn BackingStore>,
    marker: FileHandle,
    expiry: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    target: PathBuf,
    marker: PathBuf,
    state: AtomicU8,
    held: parking_lot::Mutex<Option<Held>>,
}

/// Advisory lease on one target file, implemented as a `<target>.lock` marker next to it.
///
/// A lease is single-use: once it has been active and released (explicitly or by expiry) it
/// cannot be acquired again. Only cooperating writers that use the same marker convention
/// are excluded; plain readers and foreign tools are not.
#[derive(Debug)]
pub struct LeaseLock {
    shared: Arc<Shared>,
}

impl LeaseLock {
    pub fn new(target: impl Into<PathBuf>) -> Result<Self, Error> {
        let target = target.into();
        let marker = marker_path_for(&target).ok_or_else(|| Error::LockAcquisitionFailed {
            path: target.clone(),
            reason: "target has no file name".to_string(),
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                target,
                marker,
                state: AtomicU8::new(IDLE),
                held: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn target(&self) -> &Path {
        &self.shared.target
    }

    pub fn marker_path(&self) -> &Path {
        &self.shared.marker
    }

    pub fn state(&self) -> LeaseState {
        LeaseState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaseState::Active
    }

    /// Tries to take the lease by creating the marker through `store`.
    ///
    /// Returns `Ok(false)` if another writer holds the marker; the lease stays idle and may be
    /// retried. On success the marker holds the [`Diagnostics`] of this process and an expiry
    /// timer is armed that force-releases the lease after `expiry`.
    #[instrument(skip(self, store, options), fields(marker = ?self.shared.marker))]
    pub async fn acquire(
        &self,
        store: Arc<dyn BackingStore>,
        options: &AccessOptions,
        expiry: Duration,
    ) -> Result<bool, Error> {
        if let Err(current) = self.shared.state.compare_exchange(
            IDLE,
            ACQUIRING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::LockAcquisitionFailed {
                path: self.shared.marker.clone(),
                reason: format!(
                    "lease is {} and cannot be acquired again",
                    LeaseState::from_raw(current)
                ),
            });
        }
        match self.create_marker(&store, options).await {
            Ok(Some(marker)) => {
                let token = CancellationToken::new();
                *self.shared.held.lock() = Some(Held {
                    store,
                    marker,
                    expiry: token.clone(),
                });
                self.shared.state.store(ACTIVE, Ordering::Release);
                tokio::spawn(expire(self.shared.clone(), token, expiry));
                tracing::debug!("acquired lease, expires in {:?}", expiry);
                Ok(true)
            }
            Ok(None) => {
                self.shared.state.store(IDLE, Ordering::Release);
                Ok(false)
            }
            Err(error) => {
                self.shared.state.store(IDLE, Ordering::Release);
                Err(error)
            }
        }
    }

    async fn create_marker(
        &self,
        store: &Arc<dyn BackingStore>,
        options: &AccessOptions,
    ) -> Result<Option<FileHandle>, Error> {
        let marker_path = &self.shared.marker;
        let fs_error = |source: anyhow::Error| Error::filesystem(marker_path.clone(), source);
        let marker = store
            .resolve(marker_path, options)
            .await
            .map_err(fs_error)?;
        let _guard = path_lock::lock(&store.describe(), marker.path()).await;
        let created = if store.supports_exclusive_create() {
            store.create_exclusive(&marker).await.map_err(fs_error)?
        } else if store.exists(&marker).await.map_err(fs_error)? {
            false
        } else {
            store.create_file(&marker).await.map_err(fs_error)?;
            true
        };
        if !created {
            tracing::debug!("lock marker {:?} is held by another writer", marker_path);
            return Ok(None);
        }
        if let Err(error) = write_diagnostics(store.as_ref(), &marker).await {
            if let Err(cleanup) = store.delete(&marker).await {
                tracing::warn!(
                    "failed removing partially written lock marker {:?}: {:#}",
                    marker_path,
                    &cleanup
                );
            }
            return Err(fs_error(error));
        }
        Ok(Some(marker))
    }

    /// Gives the lease up by removing its marker.
    ///
    /// Returns `Ok(false)` if the lease is not active (never acquired, already released or
    /// expired); callers should treat that as benign.
    #[instrument(skip(self), fields(marker = ?self.shared.marker))]
    pub async fn release(&self) -> Result<bool, Error> {
        if self
            .shared
            .state
            .compare_exchange(ACTIVE, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("lease is {}, nothing to release", self.state());
            return Ok(false);
        }
        let held = self.shared.held.lock().take();
        let Some(held) = held else {
            return Ok(true);
        };
        held.expiry.cancel();
        let deleted = remove_marker(held.store.as_ref(), &held.marker)
            .await
            .map_err(|source| Error::filesystem(self.shared.marker.clone(), source))?;
        if !deleted {
            tracing::warn!(
                "lock marker {:?} was already gone on release",
                &self.shared.marker
            );
        }
        Ok(true)
    }

    /// Like [`LeaseLock::release`] but reports a lease that was not active as
    /// [`Error::LockReleaseFailed`].
    pub async fn release_strict(&self) -> Result<(), Error> {
        if self.release().await? {
            Ok(())
        } else {
            Err(Error::LockReleaseFailed {
                path: self.shared.marker.clone(),
            })
        }
    }
}

async fn write_diagnostics(store: &dyn BackingStore, marker: &FileHandle) -> anyhow::Result<()> {
    let mut writer = store.open_write(marker, false).await?;
    writer
        .write_all(Diagnostics::current().to_string().as_bytes())
        .await?;
    writer.shutdown().await?;
    Ok(())
}

/// Deletes the marker, retrying up to [`MARKER_REMOVAL_ATTEMPTS`] times.
async fn remove_marker(store: &dyn BackingStore, marker: &FileHandle) -> anyhow::Result<bool> {
    let mut attempt = 1;
    loop {
        match store.delete(marker).await {
            Ok(deleted) => return Ok(deleted),
            Err(error) if attempt < MARKER_REMOVAL_ATTEMPTS => {
                tracing::warn!(
                    "attempt {}/{} removing lock marker {:?} failed: {:#}",
                    attempt,
                    MARKER_REMOVAL_ATTEMPTS,
                    marker.path(),
                    &error
                );
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn expire(shared: Arc<Shared>, token: CancellationToken, expiry: Duration) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(expiry) => {}
    }
    if shared
        .state
        .compare_exchange(ACTIVE, RELEASED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let held = shared.held.lock().take();
    let Some(held) = held else {
        return;
    };
    tracing::warn!(
        "lease on {:?} expired after {:?}, force releasing",
        &shared.target,
        expiry
    );
    if let Err(error) = remove_marker(held.store.as_ref(), &held.marker).await {
        tracing::error!(
            "giving up removing expired lock marker {:?}, remove it manually: {:#}",
            &shared.marker,
            &error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestStore;
    use common::LocalStore;
    use tracing_test::traced_test;

    const LONG: Duration = Duration::from_secs(30);

    fn local() -> Arc<dyn BackingStore> {
        Arc::new(LocalStore::new())
    }

    async fn wait_for_removal(path: &Path) -> bool {
        for _ in 0..200 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn marker_sits_next_to_target() {
        assert_eq!(
            marker_path_for(Path::new("/data/out.csv")),
            Some(PathBuf::from("/data/out.csv.lock"))
        );
        assert_eq!(marker_path_for(Path::new("/")), None);
        assert!(matches!(
            LeaseLock::new("/"),
            Err(Error::LockAcquisitionFailed { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn acquire_writes_diagnostics_and_release_removes_marker() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let target = tmp_dir.path().join("out.csv");
        let lease = LeaseLock::new(&target).unwrap();
        assert_eq!(lease.marker_path(), tmp_dir.path().join("out.csv.lock"));
        assert!(
            lease
                .acquire(local(), &AccessOptions::new(), LONG)
                .await
                .unwrap()
        );
        assert!(lease.is_active());
        let contents = std::fs::read_to_string(lease.marker_path()).unwrap();
        assert_eq!(contents.lines().count(), 3);
        let diagnostics = Diagnostics::parse(&contents).unwrap();
        assert_eq!(diagnostics.process_id, std::process::id());
        assert!(lease.release().await.unwrap());
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(!lease.marker_path().exists());
    }

    #[tokio::test]
    async fn second_writer_is_refused_until_release() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let target = tmp_dir.path().join("out.csv");
        let first = LeaseLock::new(&target).unwrap();
        let second = LeaseLock::new(&target).unwrap();
        assert!(first.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(!second.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        // losing leaves the lease reusable
        assert_eq!(second.state(), LeaseState::Idle);
        assert!(first.release().await.unwrap());
        assert!(second.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(second.release().await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn release_without_acquire_is_benign() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(!lease.release().await.unwrap());
        assert!(!lease.marker_path().exists());
        assert!(logs_contain("nothing to release"));
        assert!(matches!(
            lease.release_strict().await,
            Err(Error::LockReleaseFailed { .. })
        ));
    }

    #[tokio::test]
    async fn release_twice_only_first_counts() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(lease.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(lease.release().await.unwrap());
        assert!(!lease.release().await.unwrap());
    }

    #[tokio::test]
    async fn used_lease_cannot_be_acquired_again() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(lease.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        match lease.acquire(local(), &AccessOptions::new(), LONG).await {
            Err(Error::LockAcquisitionFailed { reason, .. }) => {
                assert_eq!(reason, "lease is active and cannot be acquired again")
            }
            other => panic!("expected LockAcquisitionFailed, got {other:?}"),
        }
        assert!(lease.release().await.unwrap());
        assert!(matches!(
            lease.acquire(local(), &AccessOptions::new(), LONG).await,
            Err(Error::LockAcquisitionFailed { .. })
        ));
        assert!(!lease.marker_path().exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_lease_is_force_released() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let target = tmp_dir.path().join("out.csv");
        let lease = LeaseLock::new(&target).unwrap();
        assert!(
            lease
                .acquire(local(), &AccessOptions::new(), Duration::from_millis(50))
                .await
                .unwrap()
        );
        assert!(wait_for_removal(lease.marker_path()).await);
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(!lease.release().await.unwrap());
        assert!(logs_contain("force releasing"));
        // another writer may now take over
        let next = LeaseLock::new(&target).unwrap();
        assert!(next.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(next.release().await.unwrap());
    }

    #[tokio::test]
    async fn release_disarms_expiry() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let target = tmp_dir.path().join("out.csv");
        let first = LeaseLock::new(&target).unwrap();
        assert!(
            first
                .acquire(local(), &AccessOptions::new(), Duration::from_millis(100))
                .await
                .unwrap()
        );
        assert!(first.release().await.unwrap());
        let second = LeaseLock::new(&target).unwrap();
        assert!(second.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        // the first lease's timer must not remove the second lease's marker
        assert!(second.marker_path().exists());
        assert!(second.is_active());
        assert!(second.release().await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn expiry_cleanup_gives_up_after_retries() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new().failing_deletes(usize::MAX));
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(
            lease
                .acquire(store.clone(), &AccessOptions::new(), Duration::from_millis(20))
                .await
                .unwrap()
        );
        for _ in 0..200 {
            if store.delete_calls() >= MARKER_REMOVAL_ATTEMPTS {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.delete_calls(), MARKER_REMOVAL_ATTEMPTS);
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(lease.marker_path().exists());
        assert!(logs_contain("giving up removing expired lock marker"));
    }

    #[tokio::test]
    async fn failed_diagnostics_write_removes_marker() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new().failing_write());
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(matches!(
            lease.acquire(store.clone(), &AccessOptions::new(), LONG).await,
            Err(Error::Filesystem { .. })
        ));
        assert!(!lease.marker_path().exists());
        assert_eq!(lease.state(), LeaseState::Idle);
    }

    #[tokio::test]
    async fn missing_directory_is_a_filesystem_error() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let lease = LeaseLock::new(tmp_dir.path().join("missing").join("out.csv")).unwrap();
        assert!(matches!(
            lease.acquire(local(), &AccessOptions::new(), LONG).await,
            Err(Error::Filesystem { .. })
        ));
        assert_eq!(lease.state(), LeaseState::Idle);
    }

    async fn race(store: Arc<dyn BackingStore>, targets: &[PathBuf]) -> usize {
        let mut join_set = tokio::task::JoinSet::new();
        let mut leases = Vec::new();
        for target in targets.iter().cycle().take(8) {
            let lease = Arc::new(LeaseLock::new(target).unwrap());
            leases.push(lease.clone());
            let store = store.clone();
            join_set.spawn(async move {
                lease
                    .acquire(store, &AccessOptions::new(), LONG)
                    .await
                    .unwrap()
            });
        }
        let mut winners = 0;
        while let Some(won) = join_set.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        for lease in leases {
            lease.release().await.unwrap();
        }
        winners
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_exactly_one_wins() {
        let tmp_dir = tempfile::tempdir().unwrap();
        assert_eq!(race(local(), &[tmp_dir.path().join("out.csv")]).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn check_then_create_is_serialized_in_process() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BackingStore> = Arc::new(TestStore::new());
        assert!(!store.supports_exclusive_create());
        assert_eq!(race(store, &[tmp_dir.path().join("out.csv")]).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn differently_spelled_targets_share_one_lock() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BackingStore> = Arc::new(TestStore::new());
        std::fs::create_dir(tmp_dir.path().join("sub")).unwrap();
        let targets = [
            tmp_dir.path().join("out.csv"),
            tmp_dir.path().join("sub").join("..").join("out.csv"),
        ];
        assert_ne!(
            marker_path_for(&targets[0]).unwrap().as_os_str(),
            marker_path_for(&targets[1]).unwrap().as_os_str()
        );
        assert_eq!(race(store, &targets).await, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn release_retries_transient_delete_failures() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new().failing_deletes(MARKER_REMOVAL_ATTEMPTS - 1));
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(lease.acquire(store.clone(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(lease.release().await.unwrap());
        assert_eq!(store.delete_calls(), MARKER_REMOVAL_ATTEMPTS);
        assert!(!lease.marker_path().exists());
        assert!(logs_contain("removing lock marker"));
        // the marker is gone, so the next writer gets in
        let next = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(next.acquire(local(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(next.release().await.unwrap());
    }

    #[tokio::test]
    async fn release_reports_persistent_delete_failure() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new().failing_deletes(usize::MAX));
        let lease = LeaseLock::new(tmp_dir.path().join("out.csv")).unwrap();
        assert!(lease.acquire(store.clone(), &AccessOptions::new(), LONG).await.unwrap());
        assert!(matches!(
            lease.release().await,
            Err(Error::Filesystem { .. })
        ));
        assert_eq!(store.delete_calls(), MARKER_REMOVAL_ATTEMPTS);
        assert_eq!(lease.state(), LeaseState::Released);
    }
}
