//! Error taxonomy for workspace operations
//!
//! Build failures are not errors: a non-zero exit is recorded as data in
//! [`crate::build::BuildStatus`]. Everything here is caught at the boundary of
//! the public workspace operation that produced it and turned into a host
//! notification or a log line.

use std::path::PathBuf;

use thiserror::Error;

/// Advisory conditions that abort an operation without mutating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("No configuration loaded")]
    NoConfiguration,
    #[error("No unit selected")]
    NoUnitSelected,
    #[error("Build already running")]
    BuildInProgress,
    #[error("No target or base path")]
    NoTargetOrBasePath,
    #[error("No active editor")]
    NoActiveEditor,
    #[error("Active editor not in workspace")]
    NotInWorkspace,
    #[error("No unit found for active editor")]
    NoUnitForSource,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to stat config file {path:?}")]
    ConfigStat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config path is not a file: {0:?}")]
    ConfigNotAFile(PathBuf),

    #[error("Failed to load config file {path:?}")]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read settings file {path:?}")]
    Settings {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Precondition(#[from] Precondition),

    #[error("Failed to read output file {path:?}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output file {path:?} is too large to send ({size} bytes, max {max})")]
    ObjectTooLarge { path: PathBuf, size: u64, max: usize },

    #[error("Failed to start task `{command}`")]
    TaskLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Diff engine exited with code {code}")]
    DiffFailed { code: i32, stderr: String },

    #[error("Unrecognized message: {0}")]
    Protocol(String),
}

impl WorkspaceError {
    /// True for conditions the user is warned about rather than shown an error
    pub fn is_advisory(&self) -> bool {
        matches!(self, WorkspaceError::Precondition(_))
    }
}
