//! Error types for the action pipeline
//!
//! `ActionError` is what a single action phase returns. `BuildError` is what
//! the pipeline hands back to its caller once a build has been aborted.

use crate::traits::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for a single action phase
#[derive(Debug, Error)]
pub enum ActionError {
    /// Required recipe field is absent
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Cross-reference or consistency check failed
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Human-readable size expression could not be parsed
    #[error("invalid size expression: {0:?}")]
    InvalidSize(String),

    /// External tool exited unsuccessfully
    #[error("{label} failed ({status}): {stderr}")]
    CommandFailed {
        label: String,
        status: String,
        stderr: String,
    },

    /// External tool could not be started
    #[error("failed to run {program}: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem operation on a known path failed
    #[error("{op} {}: {source}", path.display())]
    Path {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sandbox provider refused or failed a request
    #[error("build machine error: {0}")]
    Machine(String),

    /// Action execution failed
    #[error("action execution failed: {0}")]
    ExecutionFailed(String),
}

impl ActionError {
    /// Whether this error was raised from recipe data alone, before any
    /// external resource was touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ActionError::MissingField(_)
                | ActionError::ValidationFailed(_)
                | ActionError::InvalidSize(_)
        )
    }

    pub(crate) fn path(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ActionError::Path {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Result type for action operations
pub type Result<T> = std::result::Result<T, ActionError>;

/// Terminal failure of a whole build
#[derive(Debug, Error)]
pub enum BuildError {
    /// A phase of one action failed; nothing after it ran
    #[error("action `{action}` failed at stage {phase}: {source}")]
    Action {
        action: String,
        phase: Phase,
        #[source]
        source: ActionError,
    },

    /// The sandboxed build instance exited unsuccessfully
    #[error("build machine exited with status {0}")]
    MachineExit(i32),

    /// The sandboxed build instance could not be started
    #[error("failed to launch build machine: {0}")]
    MachineLaunch(#[source] ActionError),

    /// The scratch disk for the build machine could not be prepared
    #[error("failed to prepare build storage: {0}")]
    BuildStorage(#[source] ActionError),
}

impl BuildError {
    /// Phase the build stopped in, if it stopped inside an action
    pub fn phase(&self) -> Option<Phase> {
        match self {
            BuildError::Action { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
