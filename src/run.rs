use std::fmt;

use ::time::OffsetDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::ToolKind;
use crate::command::CommandLine;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a tool run. Transitions only move forward:
/// `pending -> starting -> running -> completed | failed | stopped`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Starting | RunStatus::Running)
    }

    /// Single forward step. `pending` only moves to `starting` here; a
    /// pending run is ended through [`ToolRun::cancel_pending`].
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Starting) => true,
            (RunStatus::Starting, RunStatus::Running) => true,
            (RunStatus::Starting | RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Mutable part of a run. Lives inside a `watch` channel so that readers
/// (progress polling, output subscribers) can observe every change.
#[derive(Debug, Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub lines: Vec<String>,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
}

impl RunState {
    fn new() -> Self {
        Self {
            status: RunStatus::Pending,
            lines: Vec::new(),
            started_at: None,
            ended_at: None,
            exit_code: None,
        }
    }
}

/// One execution of one tool against one domain.
///
/// Status changes go through [`ToolRun::advance`] / [`ToolRun::finish`],
/// which compare-and-set under the channel lock, so a stop request racing a
/// natural exit resolves to exactly one terminal status. Once terminal, the
/// output log is frozen.
#[derive(Debug)]
pub struct ToolRun {
    id: RunId,
    domain: String,
    tool: ToolKind,
    command: CommandLine,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl ToolRun {
    pub fn new(domain: impl Into<String>, tool: ToolKind, command: CommandLine) -> Self {
        Self {
            id: RunId::new(),
            domain: domain.into(),
            tool,
            command,
            cancel: CancellationToken::new(),
            state: watch::Sender::new(RunState::new()),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn status(&self) -> RunStatus {
        self.state.borrow().status
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_active()
    }

    /// Point-in-time copy of the run state, including the full log.
    pub fn snapshot(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn line_count(&self) -> usize {
        self.state.borrow().lines.len()
    }

    /// Read the current state in place without cloning the log.
    pub fn inspect<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn watch(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cancellation. The owner of the run observes the token and
    /// performs the actual transition.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Move to a non-terminal status. Returns false if the transition would
    /// not move forward.
    pub fn advance(&self, next: RunStatus) -> bool {
        debug_assert!(!next.is_terminal(), "use finish() for terminal states");
        self.state.send_if_modified(|s| {
            if !s.status.can_advance_to(next) {
                return false;
            }
            if next == RunStatus::Starting {
                s.started_at = Some(OffsetDateTime::now_utc());
            }
            s.status = next;
            true
        })
    }

    /// Move to a terminal status, recording the exit indicator.
    /// Returns false if the run already reached a terminal status.
    pub fn finish(&self, status: RunStatus, exit_code: Option<i32>) -> bool {
        debug_assert!(status.is_terminal());
        self.state.send_if_modified(|s| {
            if !s.status.can_advance_to(status) {
                return false;
            }
            s.status = status;
            s.exit_code = exit_code;
            s.ended_at = Some(OffsetDateTime::now_utc());
            true
        })
    }

    /// Stop a run that has not been picked up by a runner yet.
    /// Returns false if the run already left `pending`.
    pub fn cancel_pending(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.status != RunStatus::Pending {
                return false;
            }
            s.status = RunStatus::Stopped;
            s.ended_at = Some(OffsetDateTime::now_utc());
            true
        })
    }

    /// Append one output line. Ignored once the run is terminal.
    pub fn append_line(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        self.state.send_if_modified(move |s| {
            if s.status.is_terminal() {
                return false;
            }
            s.lines.push(line);
            true
        })
    }

    /// Record an error line and end the run as failed, in one step.
    pub fn fail_with(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.state.send_if_modified(move |s| {
            if !s.status.can_advance_to(RunStatus::Failed) {
                return false;
            }
            s.lines.push(message);
            s.status = RunStatus::Failed;
            s.ended_at = Some(OffsetDateTime::now_utc());
            true
        })
    }

    /// Wait until the run is terminal and return its final status.
    pub async fn wait_terminal(&self) -> RunStatus {
        let mut rx = self.state.subscribe();
        let status = match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(state) => state.status,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.status(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> ToolRun {
        ToolRun::new(
            "example.com",
            ToolKind::Nmap,
            CommandLine::new("nmap", ["example.com"]),
        )
    }

    #[test]
    fn transitions_only_move_forward() {
        let r = run();
        assert!(r.advance(RunStatus::Starting));
        assert!(r.snapshot().started_at.is_some());
        assert!(!r.advance(RunStatus::Starting));
        assert!(r.advance(RunStatus::Running));
        assert!(!r.advance(RunStatus::Pending));
        assert!(r.finish(RunStatus::Completed, Some(0)));
        assert!(!r.finish(RunStatus::Stopped, None));
        assert_eq!(r.status(), RunStatus::Completed);
        assert_eq!(r.snapshot().exit_code, Some(0));
    }

    #[test]
    fn pending_run_cannot_skip_starting() {
        let r = run();
        assert!(!r.advance(RunStatus::Running));
        assert!(!r.finish(RunStatus::Completed, Some(0)));
        assert!(!r.fail_with("boom"));
        assert_eq!(r.status(), RunStatus::Pending);
        assert!(r.snapshot().lines.is_empty());

        assert!(r.advance(RunStatus::Starting));
        assert!(!r.advance(RunStatus::Starting));
        assert!(r.finish(RunStatus::Failed, None));
    }

    #[test]
    fn pending_run_can_be_stopped_directly() {
        let r = run();
        assert!(r.cancel_pending());
        assert!(!r.cancel_pending());
        assert_eq!(r.status(), RunStatus::Stopped);
        assert!(!r.advance(RunStatus::Starting));
        assert!(r.snapshot().ended_at.is_some());
    }

    #[test]
    fn log_frozen_after_terminal() {
        let r = run();
        r.advance(RunStatus::Starting);
        assert!(r.append_line("one"));
        assert!(r.fail_with("boom"));
        assert!(!r.append_line("late"));
        assert_eq!(r.snapshot().lines, vec!["one", "boom"]);
        assert_eq!(r.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn wait_terminal_observes_finish() {
        let r = std::sync::Arc::new(run());
        let r2 = r.clone();
        let waiter = tokio::spawn(async move { r2.wait_terminal().await });
        r.advance(RunStatus::Starting);
        r.finish(RunStatus::Failed, Some(2));
        assert_eq!(waiter.await.unwrap(), RunStatus::Failed);
    }
}
