//! Error taxonomy shared by the engine, the store and the HTTP layer.

use crate::store::StorageError;
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// `NotFound`, `InvalidState` and `MissingInput` are returned to the caller
/// synchronously. `SpawnFailure` and `RuntimeFailure` describe what happened
/// to a task after `start` returned; they end up in the task record and the
/// log rather than in a caller's `Result`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown task, tab or module id.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Operation not valid for the current status.
    #[error("{0}")]
    InvalidState(String),

    /// A command placeholder has no input, default or global variable.
    #[error("missing value for input '{0}'")]
    MissingInput(String),

    /// The process could not be launched.
    #[error("failed to launch process: {0}")]
    SpawnFailure(String),

    /// The process launched but could not be supervised to a clean exit.
    #[error("process failed: {0}")]
    RuntimeFailure(String),

    /// Storage or unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn task_not_found(id: u64) -> Self {
        EngineError::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub fn tab_not_found(id: u64) -> Self {
        EngineError::NotFound {
            kind: "tab",
            id: id.to_string(),
        }
    }

    pub fn module_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: "module",
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
