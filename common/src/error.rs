use crate::key::ConnectionKey;

/// Stable machine-readable codes reported back to the mediation flow.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionNotFound,
    ConnectionSuspended,
    ConnectionError,
    LockAcquisitionFailed,
    LockReleaseFailed,
    FilesystemError,
    InvalidConfig,
    UnsupportedProtocol,
}

/// Errors surfaced by the connection registry, the connection handles and the lease lock.
///
/// # Cost of construction
/// `ConnectionSuspended` is raised on every attempt made against a suspended backend and is
/// therefore a plain value: it holds the connection name and the remaining time, nothing
/// else. Variants wrapping an [`anyhow::Error`] carry the full context chain (and a
/// backtrace when `RUST_BACKTRACE` is set) and are only created on real I/O failures.
///
/// # Logging Convention
/// The Display implementation shows the full cause chain:
/// ```ignore
/// tracing::error!("operation failed: {}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection {key} not found")]
    ConnectionNotFound { key: ConnectionKey },
    #[error("connection {connection} is suspended, retry in {}", format_remaining(.remaining))]
    ConnectionSuspended {
        connection: String,
        remaining: std::time::Duration,
    },
    #[error("connection {connection} failed: {source:#}")]
    ConnectionError {
        connection: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to acquire lock {path:?}: {reason}")]
    LockAcquisitionFailed {
        path: std::path::PathBuf,
        reason: String,
    },
    #[error("failed to release lock {path:?}: lock is not held")]
    LockReleaseFailed { path: std::path::PathBuf },
    #[error("filesystem operation on {path:?} failed: {source:#}")]
    Filesystem {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no backing store available for protocol {0:?}")]
    UnsupportedProtocol(String),
}

fn format_remaining(remaining: &std::time::Duration) -> humantime::FormattedDuration {
    // sub-millisecond precision is noise for an operator
    let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(std::time::Duration::from_millis(millis))
}

impl Error {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConnectionNotFound { .. } => ErrorCode::ConnectionNotFound,
            Error::ConnectionSuspended { .. } => ErrorCode::ConnectionSuspended,
            Error::ConnectionError { .. } => ErrorCode::ConnectionError,
            Error::LockAcquisitionFailed { .. } => ErrorCode::LockAcquisitionFailed,
            Error::LockReleaseFailed { .. } => ErrorCode::LockReleaseFailed,
            Error::Filesystem { .. } => ErrorCode::FilesystemError,
            Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Error::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
        }
    }

    /// Expected, recoverable conditions: the caller should report them and may retry later.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::ConnectionSuspended { .. } | Error::LockAcquisitionFailed { .. }
        )
    }

    pub fn filesystem(path: impl Into<std::path::PathBuf>, source: anyhow::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Structured result handed back to callers: a stable code plus a human readable message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for Outcome {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
