use std::path::PathBuf;

use common::{ConnectionKey, Error, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Exists,
    Read,
    Write,
    Delete,
}

/// Result of one operation as handed back to the caller, serialized as a single JSON object.
///
/// Expected conditions (suspension, lock contention) and failures alike end up in `error`;
/// the hosting flow decides what to do based on its code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Report {
    pub ok: bool,
    pub operation: Operation,
    pub connection: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Outcome>,
}

impl Report {
    pub fn new(operation: Operation, key: &ConnectionKey, path: impl Into<PathBuf>) -> Self {
        Self {
            ok: true,
            operation,
            connection: key.to_string(),
            path: path.into(),
            exists: None,
            bytes: None,
            deleted: None,
            content: None,
            error: None,
        }
    }

    /// Records `error`. Expected outcomes are logged at INFO, everything else at ERROR.
    #[must_use]
    pub fn failed(mut self, error: &Error) -> Self {
        if error.is_expected() {
            tracing::info!("{} {:?}: {}", self.operation, &self.path, error);
        } else {
            tracing::error!("{} {:?} failed: {:#}", self.operation, &self.path, error);
        }
        self.ok = false;
        self.error = Some(Outcome::from(error));
        self
    }
}
