//! Run controller for a single Valgrind session.
//!
//! `RunControl` turns a [`RunRequest`] and the Valgrind settings into a
//! process launch, relays the runner's events to an [`OutputSink`], keeps the
//! progress indicator in step, and classifies process errors into the
//! messages users see.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RunError;
use crate::models::{
    MessageFormat, ProcessError, ProcessErrorKind, ProcessSpec, RunEvent, RunRequest, RunStatus,
};
use crate::progress::TaskProgress;
use crate::runner::ValgrindRunner;
use crate::sink::{OutputSink, PopupFlags};
use crate::tools::generic_tool_arguments;

/// How often the progress bar is advanced while driving a run.
const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Controls one Valgrind run session.
pub struct RunControl<S: OutputSink> {
    request: RunRequest,
    settings: Option<Config>,
    global_settings: Config,
    sink: S,
    progress: TaskProgress,
    runner: ValgrindRunner,
    events: Option<mpsc::UnboundedReceiver<RunEvent>>,
    started: bool,
    is_stopping: bool,
    detached: bool,
    last_error: Option<ProcessErrorKind>,
    exit_code: Option<i32>,
}

impl<S: OutputSink> RunControl<S> {
    /// Create a controller using default global settings.
    pub fn new(request: RunRequest, sink: S, progress: TaskProgress) -> Self {
        Self {
            request,
            settings: None,
            global_settings: Config::default(),
            sink,
            progress,
            runner: ValgrindRunner::new(),
            events: None,
            started: false,
            is_stopping: false,
            detached: false,
            last_error: None,
            exit_code: None,
        }
    }

    /// Settings specific to this run. `None` falls back to the global settings.
    pub fn with_settings(mut self, settings: Option<Config>) -> Self {
        self.settings = settings;
        self
    }

    /// Settings used when the run has none of its own.
    pub fn with_global_settings(mut self, settings: Config) -> Self {
        self.global_settings = settings;
        self
    }

    /// Settings in effect for this run.
    pub fn settings(&self) -> &Config {
        self.settings.as_ref().unwrap_or(&self.global_settings)
    }

    /// The program being analyzed.
    pub fn executable(&self) -> &Path {
        &self.request.debuggee
    }

    #[cfg(test)]
    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    pub fn progress(&self) -> &TaskProgress {
        &self.progress
    }

    /// Valgrind arguments: generic flags, tool flags, then extra arguments.
    pub fn valgrind_arguments(&self) -> Vec<String> {
        let settings = self.settings();
        let mut args = generic_tool_arguments(settings);
        args.extend(self.request.tool.arguments(settings));
        args.extend(settings.valgrind.extra_arguments.iter().cloned());
        args.extend(self.request.extra_arguments.iter().cloned());
        args
    }

    /// The full process launch for this run.
    pub fn process_spec(&self) -> ProcessSpec {
        let mut args = self.valgrind_arguments();
        args.push(self.request.debuggee.to_string_lossy().into_owned());
        args.extend(self.request.debuggee_args.iter().cloned());

        ProcessSpec {
            program: self.settings().executable_path().to_string(),
            args,
            working_directory: self.request.working_directory.clone(),
            environment: self.request.environment.clone(),
            clear_environment: self.request.clear_environment,
        }
    }

    /// Launch Valgrind. Returns false if the process could not be spawned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> bool {
        if self.started {
            warn!("Run for {} already started", self.request.debuggee.display());
            return false;
        }

        info!(
            "Starting {} on {}",
            self.request.tool,
            self.request.debuggee.display()
        );

        let spec = self.process_spec();
        self.progress.report_started();

        if self.settings().general.debug_output {
            self.emit_debug_output(&spec);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(rx);

        match self.runner.start(&spec, tx) {
            Ok(()) => {
                self.started = true;
                debug!("Command line: {}", spec.command_line());
                true
            }
            Err(error) => {
                self.handle_process_error(error);
                self.progress.report_canceled();
                false
            }
        }
    }

    fn emit_debug_output(&mut self, spec: &ProcessSpec) {
        let options = self.valgrind_arguments().join(" ");
        let working_directory = spec
            .working_directory
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let debuggee_args = self.request.debuggee_args.join(" ");

        self.sink.append_message(
            &format!("Valgrind options: {}\n", options),
            MessageFormat::Debug,
        );
        self.sink.append_message(
            &format!("Working directory: {}\n", working_directory),
            MessageFormat::Debug,
        );
        self.sink.append_message(
            &format!("Command line arguments: {}\n", debuggee_args),
            MessageFormat::Debug,
        );
    }

    /// Request termination. A crash reported afterwards is expected.
    pub fn stop(&mut self) {
        info!("Stopping {}", self.request.tool);
        self.is_stopping = true;
        self.runner.stop();
    }

    /// The user canceled the progress indicator.
    pub fn handle_progress_canceled(&mut self) {
        self.stop();
        self.progress.report_canceled();
        self.progress.report_finished();
    }

    /// Wait for the next runner event. `None` once the runner is gone.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    pub fn handle_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Output { text, format } => self.receive_output(&text, format),
            RunEvent::Error(error) => self.handle_process_error(error),
            RunEvent::Finished { exit_code } => self.handle_finished(exit_code),
        }
    }

    fn receive_output(&mut self, text: &str, format: MessageFormat) {
        if self.detached {
            return;
        }
        self.sink.append_message(text, format);
    }

    fn handle_process_error(&mut self, error: ProcessError) {
        let classified = RunError::classify(
            &error,
            self.settings().executable_path(),
            self.is_stopping,
        );
        debug!("Process error {} classified as {:?}", error.kind, classified);

        self.last_error = Some(error.kind);
        self.sink
            .append_message(&classified.message(), MessageFormat::Error);

        if self.is_stopping {
            return;
        }
        self.sink.popup(PopupFlags::NoModeSwitch);
    }

    fn handle_finished(&mut self, exit_code: Option<i32>) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.exit_code = exit_code;

        self.sink
            .append_message("Analyzing finished.\n", MessageFormat::Normal);
        self.progress.report_finished();
        info!("{} finished: {}", self.request.tool, self.status());
    }

    /// Run until Valgrind is gone, advancing progress and stopping when
    /// `cancel` resolves.
    pub async fn drive<F>(&mut self, cancel: F) -> RunStatus
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let mut canceled = false;
        let mut ticker = tokio::time::interval(PROGRESS_TICK);

        while !self.detached {
            tokio::select! {
                event = self.next_event() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = &mut cancel, if !canceled => {
                    canceled = true;
                    self.handle_progress_canceled();
                }
                _ = ticker.tick() => self.progress.tick(),
            }
        }

        debug!(
            "Progress ended {:?} at {}%",
            self.progress.state(),
            self.progress.value()
        );

        self.status()
    }

    /// Terminal status of the session so far.
    pub fn status(&self) -> RunStatus {
        if self.last_error == Some(ProcessErrorKind::FailedToStart) {
            return RunStatus::FailedToStart;
        }
        if !self.detached {
            return RunStatus::Running;
        }
        if self.is_stopping {
            return RunStatus::Stopped;
        }
        match self.last_error {
            Some(ProcessErrorKind::Crashed) => RunStatus::Crashed,
            Some(ProcessErrorKind::ReadError | ProcessErrorKind::Unknown) => RunStatus::Failed,
            _ => RunStatus::Finished {
                exit_code: self.exit_code,
            },
        }
    }
}
