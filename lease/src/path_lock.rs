//! Process-wide mutex keyed by (store, path).
//!
//! Closes the window between "marker absent" and "marker created" for writers inside this
//! process. Writers in other processes are not covered.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

type PathMutex = tokio::sync::Mutex<()>;

static PATH_LOCKS: std::sync::LazyLock<parking_lot::Mutex<HashMap<String, Weak<PathMutex>>>> =
    std::sync::LazyLock::new(|| parking_lot::Mutex::new(HashMap::new()));

pub struct PathGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

fn mutex_for(key: String) -> Arc<PathMutex> {
    let mut locks = PATH_LOCKS.lock();
    locks.retain(|_, mutex| mutex.strong_count() > 0);
    if let Some(mutex) = locks.get(&key).and_then(Weak::upgrade) {
        return mutex;
    }
    let mutex = Arc::new(PathMutex::new(()));
    locks.insert(key, Arc::downgrade(&mutex));
    mutex
}

pub async fn lock(store: &str, path: &Path) -> PathGuard {
    let mutex = mutex_for(format!("{}{}", store, path.display()));
    PathGuard {
        _guard: mutex.lock_owned().await,
    }
}
