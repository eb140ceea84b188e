//! Configuration types for runtime, logging, connections and locking

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::store::AccessOptions;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Tracing configuration for debugging
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Debug log file path, receives TRACE level output regardless of verbosity
    pub debug_log_file: Option<String>,
}

/// Durations in configuration files are written in human readable form ("5s", "250ms").
mod human_duration {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text: String = serde::Deserialize::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        pub fn serialize<S: serde::Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: serde::Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let text: Option<String> = serde::Deserialize::deserialize(deserializer)?;
            text.map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    File,
    Ftp,
    Ftps,
    Sftp,
}

impl Protocol {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !matches!(self, Protocol::File)
    }

    #[must_use]
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::File => None,
            Protocol::Ftp | Protocol::Ftps => Some(21),
            Protocol::Sftp => Some(22),
        }
    }
}

/// How writers to a shared target path are serialized.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LockScheme {
    /// No locking, concurrent writers may interleave
    #[default]
    None,
    /// Sibling `.lock` marker file on the backing store
    Marker,
}

pub const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(30);

fn default_lock_expiry() -> Duration {
    DEFAULT_LOCK_EXPIRY
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default)]
    pub scheme: LockScheme,
    /// Lease lifetime; an abandoned marker is removed after this long
    #[serde(default = "default_lock_expiry", with = "human_duration")]
    pub expiry: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            scheme: LockScheme::None,
            expiry: DEFAULT_LOCK_EXPIRY,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.scheme == LockScheme::Marker && self.expiry.is_zero() {
            return Err("lock expiry must be greater than zero".to_string());
        }
        Ok(())
    }
}

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_MAX_FAILURE_RETRY_COUNT: u32 = 3;
pub const DEFAULT_SUSPEND_DURATION: Duration = Duration::from_secs(30);

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_failure_retry_count() -> u32 {
    DEFAULT_MAX_FAILURE_RETRY_COUNT
}

fn default_suspend_duration() -> Duration {
    DEFAULT_SUSPEND_DURATION
}

fn default_backoff_multiplier() -> u32 {
    1
}

/// Parameters of one backend connection as supplied by the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Base directory relative paths are resolved against
    pub working_dir: std::path::PathBuf,
    /// Consecutive failures before the connection is suspended (0 = never suspend)
    #[serde(default = "default_max_failure_retry_count")]
    pub max_failure_retry_count: u32,
    /// How long a suspension lasts
    #[serde(default = "default_suspend_duration", with = "human_duration")]
    pub suspend_duration: Duration,
    /// Growth factor applied to each consecutive suspension (1 = fixed backoff)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Upper bound for a grown suspension
    #[serde(default, with = "human_duration::option")]
    pub max_backoff: Option<Duration>,
    /// Protocol-specific options, passed to the backing store as-is
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub lock: LockConfig,
}

impl ConnectionConfig {
    /// Configuration for a local-disk connection with default suspension settings.
    pub fn local(
        namespace: impl Into<String>,
        name: impl Into<String>,
        working_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            protocol: Protocol::File,
            host: None,
            port: None,
            username: None,
            password: None,
            working_dir: working_dir.into(),
            max_failure_retry_count: DEFAULT_MAX_FAILURE_RETRY_COUNT,
            suspend_duration: DEFAULT_SUSPEND_DURATION,
            backoff_multiplier: 1,
            max_backoff: None,
            options: BTreeMap::new(),
            lock: LockConfig::default(),
        }
    }

    pub fn key(&self) -> crate::key::ConnectionKey {
        crate::key::ConnectionKey::new(&self.namespace, &self.name)
    }

    pub fn access_options(&self) -> AccessOptions {
        AccessOptions::from(self.options.clone())
    }

    /// Checks that required parameters are present; values are not interpreted here.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("connection name must not be empty".to_string());
        }
        if self.namespace.trim().is_empty() {
            return Err(format!("connection {}: namespace must not be empty", self.name));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(format!("connection {}: working_dir must be specified", self.name));
        }
        if self.protocol.is_remote()
            && self.host.as_deref().is_none_or(|host| host.trim().is_empty())
        {
            return Err(format!(
                "connection {}: host must be specified for protocol {}",
                self.name, self.protocol
            ));
        }
        if self.max_failure_retry_count > 0 && self.suspend_duration.is_zero() {
            return Err(format!(
                "connection {}: suspend_duration must be greater than zero when max_failure_retry_count is set",
                self.name
            ));
        }
        if self.backoff_multiplier == 0 {
            return Err(format!(
                "connection {}: backoff_multiplier must be at least 1",
                self.name
            ));
        }
        self.lock
            .validate()
            .map_err(|error| format!("connection {}: {}", self.name, error))
    }
}

/// Top level of a JSON connections file.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionsFile {
    pub connections: Vec<ConnectionConfig>,
}

impl ConnectionsFile {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let file: Self = serde_json::from_str(text).context("failed parsing connections file")?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading connections file {:?}", path))?;
        Self::parse(&text).with_context(|| format!("invalid connections file {:?}", path))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for connection in &self.connections {
            connection.validate().map_err(|error| anyhow!(error))?;
            if !seen.insert(connection.key()) {
                return Err(anyhow!("duplicate connection {}", connection.key()));
            }
        }
        Ok(())
    }

    pub fn find(&self, namespace: &str, name: &str) -> Option<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|connection| connection.namespace == namespace && connection.name == name)
    }
}
