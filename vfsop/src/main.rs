use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{ConnectionKey, ConnectionsFile, LockConfig, LockScheme};
use pool::StoreFactories;
use tracing::instrument;
use vfsop::{Connections, Operation, Report, WriteSettings};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vfsop",
    version,
    about = "Run one file operation against a configured connection",
    long_about = "`vfsop` runs a single exists/read/write/delete against a connection from a JSON \
connections file and prints the outcome as JSON on stdout.

EXAMPLE:
    # Write a file under the connection's working directory, holding a lease while writing
    vfsop --config connections.json --connection local write out.csv --data 'id,amount' --lock marker

Expected conditions (suspended connection, lock held by another writer) are reported with a \
stable error code and exit status 1, like any other failure."
)]
struct Args {
    // Connection
    /// JSON file listing the available connections
    #[arg(long, value_name = "PATH", help_heading = "Connection")]
    config: PathBuf,

    /// Namespace the connection is looked up in
    #[arg(long, default_value = common::config::DEFAULT_NAMESPACE, value_name = "NAME", help_heading = "Connection")]
    namespace: String,

    /// Name of the connection
    #[arg(short = 'c', long, value_name = "NAME", help_heading = "Connection")]
    connection: String,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also write TRACE level logs to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    debug_log_file: Option<String>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Check whether a file exists
    Exists {
        /// Path, relative to the connection's working directory unless absolute
        path: PathBuf,
    },
    /// Read a file
    Read {
        path: PathBuf,
        /// Save the contents to this local file instead of including them in the report
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Write a file
    Write {
        path: PathBuf,
        /// Contents to write
        #[arg(long, value_name = "TEXT", conflicts_with = "input", required_unless_present = "input")]
        data: Option<String>,
        /// Local file whose contents are written
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
        /// Append instead of replacing the file
        #[arg(long)]
        append: bool,
        /// Lock scheme for this write (none, marker), defaults to the connection's setting
        #[arg(long, value_name = "SCHEME")]
        lock: Option<LockScheme>,
        /// Lease lifetime, e.g. "30s" or "2min", defaults to the connection's setting
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        lock_expiry: Option<Duration>,
    },
    /// Delete a file
    Delete { path: PathBuf },
}

fn lock_override(
    file: &ConnectionsFile,
    key: &ConnectionKey,
    scheme: Option<LockScheme>,
    expiry: Option<Duration>,
) -> Result<Option<LockConfig>> {
    if scheme.is_none() && expiry.is_none() {
        return Ok(None);
    }
    let base = file
        .find(&key.namespace, &key.name)
        .map(|connection| connection.lock.clone())
        .unwrap_or_default();
    let lock = LockConfig {
        scheme: scheme.unwrap_or(base.scheme),
        expiry: expiry.unwrap_or(base.expiry),
    };
    lock.validate().map_err(|error| anyhow!(error))?;
    Ok(Some(lock))
}

async fn run_command(
    connections: &Connections,
    file: &ConnectionsFile,
    key: &ConnectionKey,
    command: Command,
) -> Result<Report> {
    let report = match command {
        Command::Exists { path } => {
            let report = Report::new(Operation::Exists, key, &path);
            match vfsop::exists(connections, key, &path).await {
                Ok(exists) => Report {
                    exists: Some(exists),
                    ..report
                },
                Err(error) => report.failed(&error),
            }
        }
        Command::Read { path, output } => {
            let report = Report::new(Operation::Read, key, &path);
            match output {
                Some(output) => {
                    let mut sink = tokio::fs::File::create(&output)
                        .await
                        .with_context(|| format!("failed creating output file {:?}", &output))?;
                    match vfsop::read(connections, key, &path, &mut sink).await {
                        Ok(bytes) => Report {
                            bytes: Some(bytes),
                            ..report
                        },
                        Err(error) => report.failed(&error),
                    }
                }
                None => {
                    let mut contents = Vec::new();
                    match vfsop::read(connections, key, &path, &mut contents).await {
                        Ok(bytes) => Report {
                            bytes: Some(bytes),
                            content: Some(String::from_utf8_lossy(&contents).into_owned()),
                            ..report
                        },
                        Err(error) => report.failed(&error),
                    }
                }
            }
        }
        Command::Write {
            path,
            data,
            input,
            append,
            lock,
            lock_expiry,
        } => {
            let report = Report::new(Operation::Write, key, &path);
            let settings = WriteSettings {
                append,
                lock: lock_override(file, key, lock, lock_expiry)?,
            };
            let result = match (data, input) {
                (_, Some(input)) => {
                    let mut source = tokio::fs::File::open(&input)
                        .await
                        .with_context(|| format!("failed opening input file {:?}", &input))?;
                    vfsop::write(connections, key, &path, &mut source, &settings).await
                }
                (Some(data), None) => {
                    vfsop::write(connections, key, &path, &mut data.as_bytes(), &settings).await
                }
                (None, None) => return Err(anyhow!("nothing to write, pass --data or --input")),
            };
            match result {
                Ok(bytes) => Report {
                    bytes: Some(bytes),
                    ..report
                },
                Err(error) => report.failed(&error),
            }
        }
        Command::Delete { path } => {
            let report = Report::new(Operation::Delete, key, &path);
            match vfsop::delete(connections, key, &path).await {
                Ok(deleted) => Report {
                    deleted: Some(deleted),
                    ..report
                },
                Err(error) => report.failed(&error),
            }
        }
    };
    Ok(report)
}

#[instrument]
async fn async_main(args: Args) -> Result<Report> {
    let file = ConnectionsFile::load(&args.config)?;
    let key = ConnectionKey::new(&args.namespace, &args.connection);
    let connections = Connections::new(file.clone(), StoreFactories::default());
    let report = run_command(&connections, &file, &key, args.command).await;
    connections.shutdown(&args.namespace).await;
    report
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
    };
    let Some(report) = common::run(output, runtime, tracing, func) else {
        std::process::exit(1);
    };
    println!("{}", serde_json::to_string(&report)?);
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
