//! Error handling module for stagerun
//!
//! Provides the fatal error taxonomy of an install run. Every variant ends
//! the current process with a diagnostic; recovery is always "run again".

use crate::completion::CompletionError;
use crate::preflight::ValidationError;
use crate::snapshot::SnapshotError;
use thiserror::Error;

/// Main error type for an install run
#[derive(Error, Debug)]
pub enum InstallError {
    /// One or more pre-flight checks failed (nothing was mutated)
    #[error("Pre-flight check failed: {}", join_failures(.0))]
    Preflight(Vec<ValidationError>),

    /// The user configuration is incomplete or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The user declined the destructive-action confirmation
    #[error("Confirmation declined: nothing was changed on {device}")]
    ConfirmationDeclined { device: String },

    /// A step's external action failed
    #[error("Step '{step}' failed: {source}")]
    StepAction {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// The terminal handoff action failed
    #[error("Handoff failed: {0}")]
    Handoff(#[source] anyhow::Error),

    /// An abort was requested while a step was in flight
    #[error("Interrupted during step '{step}'")]
    Interrupted { step: String },

    /// The recorded progress belongs to a different step list
    #[error(
        "Recorded progress belongs to a different pipeline (stored '{stored}', current '{current}'); run `stagerun reset` to start over"
    )]
    PipelineMismatch { stored: String, current: String },

    /// Completion state could not be read or written
    #[error("Persistence error: {0}")]
    Completion(#[from] CompletionError),

    /// Configuration snapshot could not be read or written
    #[error("Persistence error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result type alias for install operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a step action error
    pub fn step(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self::StepAction {
            step: step.into(),
            source,
        }
    }

    /// Returns true for errors raised by the durable stores
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Completion(_) | Self::Snapshot(_))
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { .. } => 130,
            _ => 1,
        }
    }
}

fn join_failures(failures: &[ValidationError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
