use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::Stream;

use crate::run::{RunId, RunState, RunStatus, ToolRun};

/// One item delivered to a viewer of a run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Line { line: String },
    End { status: RunStatus, exit_code: Option<i32> },
}

/// A live view of one run's output log.
///
/// Replays every line logged so far, then follows new lines as they are
/// appended, then yields exactly one [`StreamEvent::End`] and finishes.
/// Each subscription keeps its own cursor into the shared log, so a slow
/// viewer never holds back the producer or other viewers. Dropping the
/// subscription unsubscribes.
pub struct Subscription {
    run_id: RunId,
    inner: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
}

impl Subscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Attach a new viewer to `run`.
pub fn subscribe(run: &ToolRun) -> Subscription {
    Subscription {
        run_id: run.id(),
        inner: Box::pin(follow(run.watch())),
    }
}

fn follow(mut rx: watch::Receiver<RunState>) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let mut cursor = 0usize;
        loop {
            // Copy out under the read lock, yield after releasing it.
            let (fresh, end) = {
                let state = rx.borrow_and_update();
                let fresh = state.lines[cursor..].to_vec();
                let end = state
                    .status
                    .is_terminal()
                    .then_some((state.status, state.exit_code));
                (fresh, end)
            };
            cursor += fresh.len();
            for line in fresh {
                yield StreamEvent::Line { line };
            }
            if let Some((status, exit_code)) = end {
                yield StreamEvent::End { status, exit_code };
                break;
            }
            if rx.changed().await.is_err() {
                // Run dropped from the registry without reaching a terminal state.
                break;
            }
        }
    }
}
