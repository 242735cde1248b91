//! Run failure taxonomy.
//!
//! Every failure of a run ends up as exactly one line in the output sink;
//! the `Display` implementation of [`RunError`] is that line.

use thiserror::Error;

use crate::models::{ProcessError, ProcessErrorKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Error: no Valgrind executable set.")]
    ConfigurationMissing,

    #[error("Error: \"{executable}\" could not be started: {reason}")]
    SpawnFailed { executable: String, reason: String },

    #[error("** {0} **")]
    Runtime(String),

    #[error("Process terminated.")]
    ExpectedTerminationAfterStop,
}

impl RunError {
    /// Classify a process error reported while running `executable`.
    ///
    /// Start failures win over everything else; a crash is only benign when
    /// it follows an explicit stop.
    pub fn classify(error: &ProcessError, executable: &str, stopping: bool) -> Self {
        match (error.kind, stopping) {
            (ProcessErrorKind::FailedToStart, _) if executable.is_empty() => {
                RunError::ConfigurationMissing
            }
            (ProcessErrorKind::FailedToStart, _) => RunError::SpawnFailed {
                executable: executable.to_string(),
                reason: error.message.clone(),
            },
            (ProcessErrorKind::Crashed, true) => RunError::ExpectedTerminationAfterStop,
            _ => RunError::Runtime(error.message.clone()),
        }
    }

    /// The sink line for this error.
    pub fn message(&self) -> String {
        format!("{}\n", self)
    }
}
