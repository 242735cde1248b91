//! Timed progress indicator for a run.
//!
//! Valgrind gives no progress information, so the bar advances with elapsed
//! time over an expected duration and only reaches 100 when the run
//! completes.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Upper bound of the progress counter.
pub const PROGRESS_MAX: u64 = 100;

/// Lifecycle of a progress indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Idle,
    Running,
    Completed,
    Canceled,
}

/// Cancellable progress indicator backed by an indicatif bar.
pub struct TaskProgress {
    bar: ProgressBar,
    title: String,
    expected: Duration,
    state: ProgressState,
    value: u64,
    started_at: Option<Instant>,
}

impl TaskProgress {
    /// Create a visible progress bar.
    pub fn new(title: &str, expected: Duration) -> Self {
        let bar = ProgressBar::new(PROGRESS_MAX);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self::with_bar(bar, title, expected)
    }

    /// Create a progress indicator that draws nothing.
    pub fn hidden(title: &str, expected: Duration) -> Self {
        Self::with_bar(ProgressBar::hidden(), title, expected)
    }

    fn with_bar(bar: ProgressBar, title: &str, expected: Duration) -> Self {
        Self {
            bar,
            title: title.to_string(),
            expected,
            state: ProgressState::Idle,
            value: 0,
            started_at: None,
        }
    }

    /// Handle to the underlying bar, for printing around it.
    pub fn bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Start reporting. Only an idle indicator can be started.
    pub fn report_started(&mut self) {
        if self.state != ProgressState::Idle {
            return;
        }
        self.state = ProgressState::Running;
        self.started_at = Some(Instant::now());
        self.bar.set_message(self.title.clone());
        self.bar.set_position(0);
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    /// Advance the counter from the elapsed time.
    pub fn tick(&mut self) {
        if let Some(started_at) = self.started_at {
            self.advance(started_at.elapsed());
        }
    }

    /// Advance the counter as if `elapsed` had passed since start.
    ///
    /// The counter never moves backwards and stays below the maximum until
    /// the run completes.
    pub fn advance(&mut self, elapsed: Duration) {
        if self.state != ProgressState::Running {
            return;
        }
        let expected = self.expected.as_millis().max(1);
        let target = (elapsed.as_millis() * u128::from(PROGRESS_MAX) / expected)
            .min(u128::from(PROGRESS_MAX - 1)) as u64;
        if target > self.value {
            self.value = target;
            self.bar.set_position(target);
        }
    }

    /// Mark the task as canceled. Returns false if it had already ended.
    pub fn report_canceled(&mut self) -> bool {
        if !matches!(self.state, ProgressState::Idle | ProgressState::Running) {
            return false;
        }
        self.state = ProgressState::Canceled;
        self.bar.abandon_with_message(format!("{} (canceled)", self.title));
        true
    }

    /// Mark the task as completed. Returns false if it had already ended.
    ///
    /// A canceled task stays canceled.
    pub fn report_finished(&mut self) -> bool {
        if self.state != ProgressState::Running {
            return false;
        }
        self.state = ProgressState::Completed;
        self.value = PROGRESS_MAX;
        self.bar.set_position(PROGRESS_MAX);
        self.bar.finish_and_clear();
        true
    }

    #[cfg(test)]
    pub fn is_canceled(&self) -> bool {
        self.state == ProgressState::Canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> TaskProgress {
        TaskProgress::hidden("Analyzing Memory", Duration::from_secs(100))
    }

    #[test]
    fn test_lifecycle() {
        let mut progress = progress();
        assert_eq!(progress.state(), ProgressState::Idle);

        progress.report_started();
        assert_eq!(progress.state(), ProgressState::Running);
        assert_eq!(progress.value(), 0);

        assert!(progress.report_finished());
        assert_eq!(progress.state(), ProgressState::Completed);
        assert_eq!(progress.value(), PROGRESS_MAX);
    }

    #[test]
    fn test_advance_is_monotonic_and_capped() {
        let mut progress = progress();
        progress.report_started();

        progress.advance(Duration::from_secs(30));
        assert_eq!(progress.value(), 30);

        progress.advance(Duration::from_secs(10));
        assert_eq!(progress.value(), 30);

        progress.advance(Duration::from_secs(1_000));
        assert_eq!(progress.value(), PROGRESS_MAX - 1);
    }

    #[test]
    fn test_advance_ignored_unless_running() {
        let mut progress = progress();
        progress.advance(Duration::from_secs(50));
        assert_eq!(progress.value(), 0);

        progress.report_started();
        progress.report_canceled();
        progress.advance(Duration::from_secs(50));
        assert_eq!(progress.value(), 0);
    }

    #[test]
    fn test_finish_twice_reports_once() {
        let mut progress = progress();
        progress.report_started();
        assert!(progress.report_finished());
        assert!(!progress.report_finished());
        assert!(!progress.report_canceled());
        assert_eq!(progress.state(), ProgressState::Completed);
    }

    #[test]
    fn test_cancel_then_finish_stays_canceled() {
        let mut progress = progress();
        progress.report_started();
        assert!(progress.report_canceled());
        assert!(!progress.report_finished());
        assert!(progress.is_canceled());
    }

    #[test]
    fn test_cancel_before_start() {
        let mut progress = progress();
        assert!(progress.report_canceled());
        progress.report_started();
        assert_eq!(progress.state(), ProgressState::Canceled);
    }
}
