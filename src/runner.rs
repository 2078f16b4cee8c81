use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::run::{RunStatus, ToolRun};

/// Default time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Time allowed for the kernel to reap a killed process.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long trailing output is collected once the tool process is gone.
/// Bounds the wait when a leftover descendant still holds the pipes.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Lines buffered between the pipe readers and the run log.
const LINE_BUFFER: usize = 256;

enum Outcome {
    Exited(ExitStatus),
    Stopped(Option<ExitStatus>),
    WaitFailed(std::io::Error),
}

/// Spawns and supervises the external process behind a [`ToolRun`].
///
/// The task started by [`ProcessRunner::start`] is the only writer of the
/// run's status and log while the run is live. [`ProcessRunner::stop`] only
/// signals it through the run's cancellation token, except for runs that
/// were never picked up, which it finishes directly.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_GRACE)
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Upper bound on how long [`ProcessRunner::stop`] may wait.
    pub fn stop_deadline(&self) -> Duration {
        self.grace + KILL_WAIT * 2 + DRAIN_WAIT * 2
    }

    /// Run `run` on a new task. The handle resolves to the terminal status.
    pub fn start(&self, run: Arc<ToolRun>) -> JoinHandle<RunStatus> {
        let runner = self.clone();
        tokio::spawn(async move { runner.execute(&run).await })
    }

    pub fn is_alive(&self, run: &ToolRun) -> bool {
        run.is_alive()
    }

    /// Execute the run to completion on the current task.
    pub async fn execute(&self, run: &ToolRun) -> RunStatus {
        if !run.advance(RunStatus::Starting) {
            return run.status();
        }
        if run.is_cancelled() {
            run.finish(RunStatus::Stopped, None);
            return RunStatus::Stopped;
        }

        let cmd = run.command();
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach everything the tool forks.
        #[cfg(unix)]
        command.process_group(0);
        let spawned = command.spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = ScanError::SpawnFailure {
                    program: cmd.program.clone(),
                    reason: e.to_string(),
                };
                warn!(domain = run.domain(), tool = %run.tool(), run_id = %run.id(), "{err}");
                run.fail_with(err.to_string());
                return run.status();
            }
        };
        let pid = child.id();
        run.advance(RunStatus::Running);
        info!(
            domain = run.domain(),
            tool = %run.tool(),
            run_id = %run.id(),
            pid,
            command = %cmd,
            "tool started"
        );

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let mut pumps = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let outcome = self.supervise(run, &mut child, pid, rx).await;
        pumps.abort_all();

        let status = match outcome {
            Outcome::Exited(exit) if exit.success() => {
                run.finish(RunStatus::Completed, exit.code());
                RunStatus::Completed
            }
            Outcome::Exited(exit) => {
                run.finish(RunStatus::Failed, exit.code());
                RunStatus::Failed
            }
            Outcome::Stopped(exit) => {
                run.finish(RunStatus::Stopped, exit.and_then(|e| e.code()));
                RunStatus::Stopped
            }
            Outcome::WaitFailed(e) => {
                run.fail_with(ScanError::ProcessError(e.to_string()).to_string());
                RunStatus::Failed
            }
        };
        info!(
            domain = run.domain(),
            tool = %run.tool(),
            run_id = %run.id(),
            status = ?status,
            lines = run.line_count(),
            "tool finished"
        );
        status
    }

    async fn supervise(
        &self,
        run: &ToolRun,
        child: &mut Child,
        pid: Option<u32>,
        mut lines: mpsc::Receiver<String>,
    ) -> Outcome {
        let cancel = run.cancel_token().clone();
        let mut pipes_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let exit = self.terminate(run, child, pid, &mut lines, &mut pipes_open).await;
                    break Outcome::Stopped(exit);
                }
                line = lines.recv(), if pipes_open => match line {
                    Some(line) => {
                        run.append_line(line);
                    }
                    None => pipes_open = false,
                },
                exit = child.wait() => {
                    break match exit {
                        Ok(exit) => Outcome::Exited(exit),
                        Err(e) => Outcome::WaitFailed(e),
                    };
                }
            }
        };

        // The tool is gone; collect what is still in flight, then make sure
        // nothing it forked outlives the run.
        if pipes_open {
            pipes_open = drain(run, &mut lines, DRAIN_WAIT).await;
        }
        signal_group(pid, GroupSignal::Kill);
        if pipes_open {
            drain(run, &mut lines, DRAIN_WAIT).await;
        }
        outcome
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    /// Output keeps flowing into the log while waiting.
    async fn terminate(
        &self,
        run: &ToolRun,
        child: &mut Child,
        pid: Option<u32>,
        lines: &mut mpsc::Receiver<String>,
        pipes_open: &mut bool,
    ) -> Option<ExitStatus> {
        if let Ok(Some(exit)) = child.try_wait() {
            return Some(exit);
        }
        if !signal_group(pid, GroupSignal::Terminate) {
            debug!(run_id = %run.id(), "termination signal not delivered");
        }
        let graceful = time::timeout(self.grace, wait_pumping(run, child, lines, pipes_open)).await;
        match graceful {
            Ok(Ok(exit)) => Some(exit),
            _ => {
                warn!(
                    domain = run.domain(),
                    tool = %run.tool(),
                    run_id = %run.id(),
                    grace_ms = self.grace.as_millis() as u64,
                    "tool ignored termination request, killing"
                );
                if !signal_group(pid, GroupSignal::Kill) {
                    if let Err(e) = child.start_kill() {
                        warn!(run_id = %run.id(), "kill failed: {e}");
                    }
                }
                time::timeout(KILL_WAIT, wait_pumping(run, child, lines, pipes_open))
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        }
    }

    /// Ask a run to stop and wait, bounded, for it to become terminal.
    ///
    /// Stopping a terminal run is a no-op that reports success. Returns false
    /// only if the run is still not terminal after [`Self::stop_deadline`].
    pub async fn stop(&self, run: &ToolRun) -> bool {
        if run.status().is_terminal() {
            return true;
        }
        run.request_stop();
        if run.cancel_pending() {
            info!(domain = run.domain(), tool = %run.tool(), run_id = %run.id(), "queued run stopped");
            return true;
        }
        match time::timeout(self.stop_deadline(), run.wait_terminal()).await {
            Ok(_) => true,
            Err(_) => {
                warn!(run_id = %run.id(), "run did not stop within deadline");
                false
            }
        }
    }
}

/// Wait for the child to exit while still moving its output into the log.
async fn wait_pumping(
    run: &ToolRun,
    child: &mut Child,
    lines: &mut mpsc::Receiver<String>,
    pipes_open: &mut bool,
) -> std::io::Result<ExitStatus> {
    loop {
        tokio::select! {
            line = lines.recv(), if *pipes_open => match line {
                Some(line) => {
                    run.append_line(line);
                }
                None => *pipes_open = false,
            },
            exit = child.wait() => return exit,
        }
    }
}

/// Move buffered and in-flight lines into the log until both pipes close or
/// `limit` passes. Returns whether the pipes are still open.
async fn drain(run: &ToolRun, lines: &mut mpsc::Receiver<String>, limit: Duration) -> bool {
    let closed = time::timeout(limit, async {
        while let Some(line) = lines.recv().await {
            run.append_line(line);
        }
    })
    .await;
    closed.is_err()
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the tool's whole process group. Returns false if nothing was
/// signalled, e.g. because the group is already empty.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match pid {
        Some(pid) => killpg(Pid::from_raw(pid as i32), signal).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}

/// Forward a pipe to the run, one line per message, lossily decoded.
async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output pipe read failed: {e}");
                break;
            }
        }
    }
}
