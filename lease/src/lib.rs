//! Advisory lease lock built from marker files
//!
//! Before writing `out.csv` a writer creates `out.csv.lock` in the same directory through
//! the connection's backing store. Whoever creates the marker holds the lease; everybody
//! else sees it and backs off. The marker carries host name, host address and process id
//! of the holder (see [`Diagnostics`]) so operators can find who left a stale one behind.
//!
//! Exclusion between processes is only as strong as the backend's create primitive: stores
//! that support exclusive create give a real guarantee, others fall back to
//! check-then-create which can race across processes. Inside one process a keyed mutex
//! serializes the check and the create.
//!
//! Every active lease is bounded by an expiry timer. When it fires the lease is
//! force-released and the marker removed.
//!
//! ```rust,no_run
//! # async fn example(store: std::sync::Arc<dyn common::BackingStore>) -> Result<(), common::Error> {
//! let lease = lease::LeaseLock::new("/data/out.csv")?;
//! if lease
//!     .acquire(store, &common::AccessOptions::new(), std::time::Duration::from_secs(30))
//!     .await?
//! {
//!     // ... write /data/out.csv ...
//!     lease.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod diagnostics;
mod lock;
mod path_lock;
#[cfg(test)]
mod testutils;

pub use diagnostics::Diagnostics;
pub use lock::{MARKER_REMOVAL_ATTEMPTS, LeaseLock, LeaseState, marker_path_for};
