use std::collections::BTreeMap;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::ToolKind;
use crate::run::{RunId, RunStatus, ToolRun};

/// Aggregate status of all runs of one domain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Pending,
    Scanning,
    Completed,
}

/// Per-tool entry of a domain's progress report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolProgress {
    pub run_id: RunId,
    pub status: RunStatus,
    pub command: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub exit_code: Option<i32>,
    pub lines: usize,
}

impl ToolProgress {
    pub fn of(run: &ToolRun) -> Self {
        run.inspect(|s| Self {
            run_id: run.id(),
            status: s.status,
            command: run.command().to_string(),
            started_at: s.started_at.map(rfc3339),
            ended_at: s.ended_at.map(rfc3339),
            exit_code: s.exit_code,
            lines: s.lines.len(),
        })
    }
}

/// Progress of one domain, recomputed from its runs on every read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DomainScanState {
    pub domain: String,
    pub status: DomainStatus,
    pub progress_percent: u8,
    /// Display name of the earliest started run still starting or running.
    pub current_tool_label: Option<String>,
    pub total_tools: usize,
    pub finished_tools: usize,
    pub failed_tools: usize,
    pub per_tool: BTreeMap<ToolKind, ToolProgress>,
}

impl DomainScanState {
    /// Compute the aggregate for `runs`, which must all belong to `domain`.
    pub fn compute<'a>(domain: &str, runs: impl IntoIterator<Item = &'a ToolRun>) -> Self {
        let mut per_tool = BTreeMap::new();
        let mut finished = 0usize;
        let mut failed = 0usize;
        let mut pending = 0usize;
        // (started_at, tool) of the current activity candidate
        let mut current: Option<(Option<OffsetDateTime>, ToolKind)> = None;

        for run in runs {
            let (status, started_at) = run.inspect(|s| (s.status, s.started_at));
            match status {
                RunStatus::Pending => pending += 1,
                RunStatus::Starting | RunStatus::Running => {
                    let candidate = (started_at, run.tool());
                    let earlier = match &current {
                        None => true,
                        Some(best) => earlier_start(&candidate, best),
                    };
                    if earlier {
                        current = Some(candidate);
                    }
                }
                RunStatus::Failed => {
                    finished += 1;
                    failed += 1;
                }
                RunStatus::Completed | RunStatus::Stopped => finished += 1,
            }
            per_tool.insert(run.tool(), ToolProgress::of(run));
        }

        let total = per_tool.len();
        let status = if total > 0 && finished == total {
            DomainStatus::Completed
        } else if pending == total {
            DomainStatus::Pending
        } else {
            DomainStatus::Scanning
        };
        let progress_percent = if total == 0 {
            0
        } else {
            (finished * 100 / total) as u8
        };

        Self {
            domain: domain.to_string(),
            status,
            progress_percent,
            current_tool_label: current.map(|(_, tool)| tool.definition().name.to_string()),
            total_tools: total,
            finished_tools: finished,
            failed_tools: failed,
            per_tool,
        }
    }
}

fn earlier_start(
    a: &(Option<OffsetDateTime>, ToolKind),
    b: &(Option<OffsetDateTime>, ToolKind),
) -> bool {
    // A run in `starting` always has a start time; None sorts last.
    let key = |x: &(Option<OffsetDateTime>, ToolKind)| (x.0.is_none(), x.0, x.1);
    key(a) < key(b)
}

/// Full description of one run, including its log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolRunView {
    pub run_id: RunId,
    pub domain: String,
    pub tool: ToolKind,
    pub command: String,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

impl ToolRunView {
    pub fn of(run: &ToolRun) -> Self {
        run.inspect(|s| Self {
            run_id: run.id(),
            domain: run.domain().to_string(),
            tool: run.tool(),
            command: run.command().to_string(),
            status: s.status,
            started_at: s.started_at.map(rfc3339),
            ended_at: s.ended_at.map(rfc3339),
            exit_code: s.exit_code,
            output: s.lines.clone(),
        })
    }
}

/// Phase of a `start_scan` batch. Only moves forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Accepted,
    Dispatching,
    Running,
    PartiallyFailed,
    Done,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BatchView {
    pub batch_id: Uuid,
    pub phase: BatchPhase,
    pub runs: Vec<ToolRunSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolRunSummary {
    pub run_id: RunId,
    pub domain: String,
    pub tool: ToolKind,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

impl ToolRunSummary {
    pub fn of(run: &ToolRun) -> Self {
        run.inspect(|s| Self {
            run_id: run.id(),
            domain: run.domain().to_string(),
            tool: run.tool(),
            status: s.status,
            exit_code: s.exit_code,
        })
    }
}

/// Acknowledgement returned by `start_scan`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanAck {
    pub accepted: bool,
    pub batch_id: Uuid,
    pub runs: usize,
}

/// Result of a stop request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSummary {
    pub success: bool,
    /// Runs that were not terminal when the stop was issued.
    pub stopped: usize,
}

pub(crate) fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
