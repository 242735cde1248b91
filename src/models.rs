//! Data models for a Valgrind run.
//!
//! This module contains the request, spawn specification and event types
//! shared by the runner and the run controller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::tools::ValgrindTool;

/// Format tag attached to every message sent to an output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFormat {
    /// Informational messages produced by the controller
    Normal,
    /// Error messages produced by the controller
    Error,
    /// Diagnostic messages (options, working directory, ...)
    Debug,
    /// Text the child process wrote to stdout
    StdOut,
    /// Text the child process wrote to stderr
    StdErr,
}

impl MessageFormat {
    /// Returns true for formats that should be rendered as errors.
    pub fn is_error(&self) -> bool {
        matches!(self, MessageFormat::Error | MessageFormat::StdErr)
    }
}

/// What the caller wants to analyze.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Program to run under Valgrind.
    pub debuggee: PathBuf,
    /// Arguments passed to the debuggee.
    pub debuggee_args: Vec<String>,
    /// Working directory for the child (None inherits ours).
    pub working_directory: Option<PathBuf>,
    /// Environment overrides applied on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting ours.
    pub clear_environment: bool,
    /// Valgrind tool to run.
    pub tool: ValgrindTool,
    /// Extra Valgrind arguments appended after the generated ones.
    pub extra_arguments: Vec<String>,
}

/// A fully resolved process launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub clear_environment: bool,
}

impl ProcessSpec {
    /// Render the command line for display purposes.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_argument)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_argument(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

/// Kinds of process errors reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    /// The program could not be launched at all.
    FailedToStart,
    /// The program was killed or terminated by a signal.
    Crashed,
    /// Reading the program's output failed.
    ReadError,
    /// Anything else (e.g. waiting on the child failed).
    Unknown,
}

impl fmt::Display for ProcessErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessErrorKind::FailedToStart => write!(f, "failed to start"),
            ProcessErrorKind::Crashed => write!(f, "crashed"),
            ProcessErrorKind::ReadError => write!(f, "read error"),
            ProcessErrorKind::Unknown => write!(f, "unknown error"),
        }
    }
}

/// A process error with its raw diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
}

impl ProcessError {
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Events delivered by the runner to the run controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// A chunk of process output, including its trailing newline.
    Output { text: String, format: MessageFormat },
    /// The process reported an error.
    Error(ProcessError),
    /// The process is gone and all of its output has been delivered.
    Finished { exit_code: Option<i32> },
}

/// Terminal status of a run session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The session has not reached a terminal state yet.
    Running,
    /// Valgrind exited on its own.
    Finished { exit_code: Option<i32> },
    /// Valgrind could not be launched.
    FailedToStart,
    /// Valgrind died without being asked to.
    Crashed,
    /// Valgrind's output or exit status could not be read.
    Failed,
    /// The user stopped the run.
    Stopped,
}

impl RunStatus {
    /// Process exit code to report for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Finished { exit_code } => exit_code.unwrap_or(1),
            RunStatus::Running | RunStatus::FailedToStart | RunStatus::Failed => 1,
            RunStatus::Crashed => 2,
            RunStatus::Stopped => 130,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Finished {
                exit_code: Some(code),
            } => write!(f, "finished (exit code {})", code),
            RunStatus::Finished { exit_code: None } => write!(f, "finished"),
            RunStatus::FailedToStart => write!(f, "failed to start"),
            RunStatus::Crashed => write!(f, "crashed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}
