//! Output sinks.
//!
//! A sink is where run output ends up: the terminal for the CLI, or a
//! recording buffer in tests.

use indicatif::ProgressBar;
use std::io::Write;
use tracing::debug;

use crate::models::MessageFormat;

/// How the host should raise the output pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupFlags {
    /// Raise the pane without changing the host's active mode.
    NoModeSwitch,
}

/// Receives run output and pane activation requests.
pub trait OutputSink {
    /// Append `text` verbatim, tagged with `format`.
    fn append_message(&mut self, text: &str, format: MessageFormat);

    /// Ask the host to show the output pane.
    fn popup(&mut self, _flags: PopupFlags) {}
}

/// Writes messages to the terminal, keeping the progress bar intact.
pub struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl OutputSink for ConsoleSink {
    fn append_message(&mut self, text: &str, format: MessageFormat) {
        self.bar.suspend(|| {
            // Ignore write errors: a closed terminal must not abort the run.
            if format.is_error() {
                let mut stderr = std::io::stderr().lock();
                let _ = stderr.write_all(text.as_bytes());
                let _ = stderr.flush();
            } else {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
        });
    }

    fn popup(&mut self, flags: PopupFlags) {
        debug!("Output pane popup requested ({:?})", flags);
    }
}

/// Sink that keeps everything it receives.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub messages: Vec<(String, MessageFormat)>,
    pub popups: Vec<PopupFlags>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn texts(&self) -> Vec<&str> {
        self.messages.iter().map(|(text, _)| text.as_str()).collect()
    }

    pub fn count(&self, text: &str) -> usize {
        self.messages.iter().filter(|(t, _)| t == text).count()
    }
}

#[cfg(test)]
impl OutputSink for RecordingSink {
    fn append_message(&mut self, text: &str, format: MessageFormat) {
        self.messages.push((text.to_string(), format));
    }

    fn popup(&mut self, flags: PopupFlags) {
        self.popups.push(flags);
    }
}
