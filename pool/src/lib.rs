//! Named backend connections with failure-driven suspension
//!
//! Every file operation starts by looking up a [`ConnectionHandle`] in the
//! [`ConnectionRegistry`] by its [`ConnectionKey`] (namespace + connection name). One handle
//! exists per key and is shared by all concurrent operations on that connection.
//!
//! # Suspension
//!
//! Each handle guards its backend with a [`SuspensionPolicy`]: after
//! `max_failure_retry_count` consecutive resolve failures the connection is suspended for
//! the configured backoff, and attempts made in that window fail fast with
//! [`common::Error::ConnectionSuspended`] without reaching the backend. The first attempt
//! after the window is a probe; success makes the connection healthy again.
//!
//! # Lifecycle
//!
//! ```rust,no_run
//! use pool::{ConnectionRegistry, StoreFactories};
//!
//! # async fn example(config: common::ConnectionConfig) -> Result<(), common::Error> {
//! // platform startup
//! let registry = ConnectionRegistry::new();
//! let factories = StoreFactories::default();
//!
//! // per operation
//! let handle = registry.connect(&config, &factories)?;
//! let file = handle
//!     .resolve_with_suspension(std::path::Path::new("out.csv"))
//!     .await?;
//! // ... I/O through handle.store() ...
//! # let _ = file;
//! registry.return_handle(handle.key(), handle.clone());
//!
//! // undeploy
//! registry.shutdown(&config.namespace).await;
//! # Ok(())
//! # }
//! ```

mod factory;
mod handle;
mod registry;
pub mod suspension;
#[cfg(test)]
mod testutils;

pub use common::ConnectionKey;
pub use factory::{LocalStoreFactory, StoreFactories, StoreFactory, connect};
pub use handle::ConnectionHandle;
pub use registry::ConnectionRegistry;
pub use suspension::{Health, HealthState, SuspensionConfig, SuspensionPolicy};
