//! Pipeline-specific error types.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur within the pipeline runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Baton '{0}' released while not held")]
    BatonNotHeld(String),

    #[error("Timed out after {waited:?} waiting on baton '{baton}'")]
    BatonTimeout { baton: String, waited: Duration },

    #[error("Wait cancelled by stop request")]
    Cancelled,

    #[error("Queue disconnected")]
    QueueDisconnected,

    #[error("Unknown stage kind '{0}'")]
    UnknownStageKind(String),

    #[error("No stage named '{0}' in pipeline")]
    UnknownStage(String),

    #[error("Failed to build stage '{stage}': {message}")]
    StageBuild { stage: String, message: String },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Worker '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Failure reported by a stage's `process` call.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    /// Emitting into the output queue failed (usually a stop request).
    #[error("Emit failed: {0}")]
    Emit(#[from] PipelineError),

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed(message.into())
    }

    /// True when the failure came from a stop request rather than the stage.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Emit(PipelineError::Cancelled))
    }
}
