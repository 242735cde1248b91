//! Child process management for Valgrind runs.
//!
//! The runner spawns the process, forwards its output line by line and
//! reports errors and completion as [`RunEvent`]s on a channel. It never
//! interprets what it forwards.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{MessageFormat, ProcessError, ProcessErrorKind, ProcessSpec, RunEvent};

/// Sending half of the run event channel.
pub type EventSender = mpsc::UnboundedSender<RunEvent>;

/// How long to wait for output to drain after killing the process group.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches one process and reports on it.
#[derive(Default)]
pub struct ValgrindRunner {
    stop_tx: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

impl ValgrindRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `spec` and start forwarding events to `events`.
    ///
    /// Must be called from within a tokio runtime. A spawn failure is
    /// returned here and nothing is sent on the channel.
    pub fn start(&mut self, spec: &ProcessSpec, events: EventSender) -> Result<(), ProcessError> {
        if spec.program.is_empty() {
            return Err(ProcessError::new(
                ProcessErrorKind::FailedToStart,
                "No program specified",
            ));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a stop also reaches forked children.
        #[cfg(unix)]
        command.process_group(0);
        if let Some(ref cwd) = spec.working_directory {
            command.current_dir(cwd);
        }
        if spec.clear_environment {
            command.env_clear();
        }
        command.envs(&spec.environment);

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::new(ProcessErrorKind::FailedToStart, e.to_string()))?;

        self.pid = child.id();
        info!(
            "Started {} (pid {})",
            spec.program,
            self.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string())
        );

        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|stream| spawn_reader(stream, MessageFormat::StdOut, events.clone())),
            child
                .stderr
                .take()
                .map(|stream| spawn_reader(stream, MessageFormat::StdErr, events.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        tokio::spawn(wait_for_exit(child, self.pid, readers, stop_rx, events));

        Ok(())
    }

    /// Request termination of the running process.
    ///
    /// Calling this before `start` or more than once does nothing.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            debug!("Stop requested for pid {:?}", self.pid);
            // The waiter may already be gone if the process exited.
            let _ = stop_tx.send(());
        }
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn spawn_reader<R>(stream: R, format: MessageFormat, events: EventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if events.send(RunEvent::Output { text, format }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read {:?} from child: {}", format, e);
                    let _ = events.send(RunEvent::Error(ProcessError::new(
                        ProcessErrorKind::ReadError,
                        e.to_string(),
                    )));
                    break;
                }
            }
        }
    })
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    StopRequested,
}

/// Resolves once a stop is requested. Never resolves if the sender is dropped.
async fn stop_requested(stop_rx: &mut Option<oneshot::Receiver<()>>) {
    if let Some(rx) = stop_rx.as_mut() {
        let requested = rx.await.is_ok();
        *stop_rx = None;
        if requested {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Kill the child and everything in its process group.
fn kill_process_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    debug!("Sent SIGKILL to process group {}", pid);
                    return;
                }
                Err(e) => debug!("Failed to kill process group {}: {}", pid, e),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!("Kill failed, process probably already exited: {}", e);
    }
}

async fn join_readers(readers: &mut [JoinHandle<()>]) {
    for reader in readers.iter_mut() {
        if !reader.is_finished() {
            let _ = reader.await;
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: Option<u32>,
    mut readers: Vec<JoinHandle<()>>,
    stop_rx: oneshot::Receiver<()>,
    events: EventSender,
) {
    let mut stop_rx = Some(stop_rx);

    let exit = tokio::select! {
        status = child.wait() => Exit::Exited(status),
        _ = stop_requested(&mut stop_rx) => Exit::StopRequested,
    };

    let (status, mut stopped) = match exit {
        Exit::Exited(status) => (status, false),
        Exit::StopRequested => {
            kill_process_tree(&mut child, pid);
            (child.wait().await, true)
        }
    };

    // Processes forked by the child can keep the pipes open after it exits.
    if !stopped {
        let drained = tokio::select! {
            _ = join_readers(&mut readers) => true,
            _ = stop_requested(&mut stop_rx) => false,
        };
        if !drained {
            kill_process_tree(&mut child, pid);
            stopped = true;
        }
    }

    if stopped
        && tokio::time::timeout(DRAIN_TIMEOUT, join_readers(&mut readers))
            .await
            .is_err()
    {
        warn!("Output still open {:?} after kill, giving up on it", DRAIN_TIMEOUT);
        for reader in &readers {
            reader.abort();
        }
    }

    let exit_code = match status {
        Ok(status) => {
            debug!("Process exited with {}", status);
            if stopped || status.code().is_none() {
                let _ = events.send(RunEvent::Error(ProcessError::new(
                    ProcessErrorKind::Crashed,
                    "Process crashed",
                )));
            }
            status.code()
        }
        Err(e) => {
            let _ = events.send(RunEvent::Error(ProcessError::new(
                ProcessErrorKind::Unknown,
                e.to_string(),
            )));
            None
        }
    };

    let _ = events.send(RunEvent::Finished { exit_code });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let finished = matches!(event, RunEvent::Finished { .. });
            events.push(event);
            if finished {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_forwards_output_and_exit_code() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runner = ValgrindRunner::new();
        runner
            .start(&shell("echo out; echo err >&2; exit 3"), tx)
            .unwrap();
        assert!(runner.pid().is_some());

        let events = collect(rx).await;
        assert!(events.contains(&RunEvent::Output {
            text: "out\n".to_string(),
            format: MessageFormat::StdOut,
        }));
        assert!(events.contains(&RunEvent::Output {
            text: "err\n".to_string(),
            format: MessageFormat::StdErr,
        }));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Finished { exit_code: Some(3) })
        );
        assert!(!events.iter().any(|e| matches!(e, RunEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_preserves_order_within_a_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runner = ValgrindRunner::new();
        runner.start(&shell("for i in 1 2 3 4 5; do echo $i; done"), tx).unwrap();

        let lines: Vec<String> = collect(rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Output { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["1\n", "2\n", "3\n", "4\n", "5\n"]);
    }

    #[tokio::test]
    async fn test_passes_working_directory_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell("pwd; echo \"$VGRUN_TEST\"");
        spec.working_directory = Some(dir.path().to_path_buf());
        spec.environment
            .insert("VGRUN_TEST".to_string(), "hello".to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        ValgrindRunner::new().start(&spec, tx).unwrap();

        let events = collect(rx).await;
        let expected_dir = format!("{}\n", dir.path().canonicalize().unwrap().display());
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::Output { text, .. } if *text == expected_dir
        )));
        assert!(events.contains(&RunEvent::Output {
            text: "hello\n".to_string(),
            format: MessageFormat::StdOut,
        }));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec {
            program: "/nonexistent/vgrun-test-binary".to_string(),
            ..Default::default()
        };
        let error = ValgrindRunner::new().start(&spec, tx).unwrap_err();
        assert_eq!(error.kind, ProcessErrorKind::FailedToStart);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_program_fails_to_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let error = ValgrindRunner::new()
            .start(&ProcessSpec::default(), tx)
            .unwrap_err();
        assert_eq!(error.kind, ProcessErrorKind::FailedToStart);
    }

    #[tokio::test]
    async fn test_stop_kills_and_reports_crash() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runner = ValgrindRunner::new();
        runner.start(&shell("exec sleep 30"), tx).unwrap();
        runner.stop();
        runner.stop();

        let events = tokio::time::timeout(std::time::Duration::from_secs(10), collect(rx))
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![
                RunEvent::Error(ProcessError::new(
                    ProcessErrorKind::Crashed,
                    "Process crashed"
                )),
                RunEvent::Finished { exit_code: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_kills_forked_children() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runner = ValgrindRunner::new();
        runner.start(&shell("sleep 20 &\nexec sleep 30"), tx).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        runner.stop();

        let events = tokio::time::timeout(std::time::Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(
            events.last(),
            Some(&RunEvent::Finished { exit_code: None })
        );
        assert!(events.contains(&RunEvent::Error(ProcessError::new(
            ProcessErrorKind::Crashed,
            "Process crashed"
        ))));
    }

    #[tokio::test]
    async fn test_stop_while_background_child_holds_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ValgrindRunner::new();
        runner.start(&shell("sleep 20 &\necho started"), tx).unwrap();

        // The shell exits at once but its background job keeps the pipes open.
        assert_eq!(
            rx.recv().await,
            Some(RunEvent::Output {
                text: "started\n".to_string(),
                format: MessageFormat::StdOut,
            })
        );
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        runner.stop();

        let events = tokio::time::timeout(std::time::Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            RunEvent::Error(ProcessError::new(
                ProcessErrorKind::Crashed,
                "Process crashed"
            ))
        );
        assert!(matches!(events[1], RunEvent::Finished { .. }));
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let mut runner = ValgrindRunner::new();
        runner.stop();
        assert!(runner.pid().is_none());
    }
}
