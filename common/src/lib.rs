//! Common utilities and types shared by the vfsconn crates
//!
//! This crate holds everything the connection registry, the lease lock and the operation
//! layer agree on:
//!
//! - [`error`]: the error taxonomy ([`Error`]) and the structured [`Outcome`] reported to
//!   mediation flows
//! - [`store`]: the [`BackingStore`] capability trait every backend implements
//! - [`local`]: [`LocalStore`], the local-disk backend
//! - [`config`]: connection, lock, runtime and logging configuration
//! - [`run`]: runtime bootstrap used by the binaries
//!
//! # Logging
//!
//! All crates log through `tracing`. Binaries call [`run`] which installs a
//! `tracing-subscriber` formatter on stderr with the level picked from `-v` flags
//! (`RUST_LOG` overrides it), plus an optional TRACE-level debug log file.

pub mod config;
pub mod error;
pub mod key;
pub mod local;
pub mod store;

pub use config::{
    ConnectionConfig, ConnectionsFile, LockConfig, LockScheme, OutputConfig, Protocol,
    RuntimeConfig, TracingConfig,
};
pub use error::{Error, ErrorCode, Outcome};
pub use key::ConnectionKey;
pub use local::LocalStore;
pub use store::{AccessOptions, BackingStore, FileHandle, ReadStream, WriteStream};

use anyhow::Context;
use tracing_subscriber::prelude::*;

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig, tracing: &TracingConfig) -> anyhow::Result<()> {
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_for(output.verbose)));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(console_filter);
    let file_layer = match &tracing.debug_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed opening debug log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_filter(tracing_subscriber::filter::LevelFilter::TRACE),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed installing tracing subscriber")?;
    Ok(())
}

/// Sets up logging and a tokio runtime, then drives `func` to completion.
///
/// Returns `None` if setup failed or `func` returned an error; the error has already been
/// reported unless `output.quiet` is set.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output, &tracing) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed building tokio runtime: {error:#}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => Some(summary),
        Err(error) => {
            tracing::debug!("operation failed: {:?}", &error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
