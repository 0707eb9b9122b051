//! Error types for each component boundary.
//!
//! Kept local to the component that raises them (spec §7: "every error is
//! local") and composed under [`SupervisorError`] only at the points where
//! the binary decides an exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Validation failure raised by the configuration validator (C2).
///
/// Carries enough context to reproduce spec.md's
/// `InvalidConfig { element_path, reason }` shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid config at {element_path}: {reason}")]
pub struct ConfigError {
    pub element_path: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(element_path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            element_path: element_path.into(),
            reason: reason.into(),
        }
    }
}

/// Failures from the process launcher (C4).
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("argument parse error in params for module {module}: {reason}")]
    ArgParse { module: String, reason: String },

    #[error("failed to open log file {path:?}: {source}")]
    LogFileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fork/exec failed for module {module}: {source}")]
    Spawn {
        module: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the service channel / counter decoder (C5/C6).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("transient I/O timeout")]
    Transient,

    #[error("connection dropped: {0}")]
    Dropped(String),

    #[error("malformed counter payload: {0}")]
    Decode(String),

    #[error("service channel blocked for this boot")]
    Blocked,
}

/// Failures writing or reading the backup store (C9). Non-fatal by design
/// (spec.md §7: "a failed backup write never blocks shutdown").
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("XML serialization error: {0}")]
    Serialize(String),

    #[error("XML parse error: {0}")]
    Parse(String),
}

/// Top-level error the binary maps to an exit code.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
