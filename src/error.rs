use thiserror::Error;

use crate::catalog::ToolKind;

/// Errors surfaced by the scan core.
///
/// Input errors (`InvalidDomain`, `UnknownTool`, `UnknownParameter`,
/// `InvalidParameterValue`) are raised before any process is spawned.
/// `SpawnFailure` and `ProcessError` describe runtime failures of a tool; the
/// orchestrator records them into the run's log instead of returning them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid domain: '{0}'")]
    InvalidDomain(String),

    #[error("unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("unknown parameter '{param}' for {tool}")]
    UnknownParameter { tool: ToolKind, param: String },

    #[error("invalid value for {key} ({tool}): {reason}")]
    InvalidParameterValue {
        tool: ToolKind,
        key: String,
        reason: String,
    },

    #[error("{tool} is already running against {domain}")]
    RunAlreadyActive { domain: String, tool: ToolKind },

    #[error("scan still in progress for {0}")]
    ActiveScanInProgress(String),

    #[error("failed to start '{program}': {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("process error: {0}")]
    ProcessError(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ScanError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::InvalidDomain(_) => "invalid_domain",
            ScanError::UnknownTool(_) => "unknown_tool",
            ScanError::UnknownParameter { .. } => "unknown_parameter",
            ScanError::InvalidParameterValue { .. } => "invalid_parameter_value",
            ScanError::RunAlreadyActive { .. } => "run_already_active",
            ScanError::ActiveScanInProgress(_) => "active_scan_in_progress",
            ScanError::SpawnFailure { .. } => "spawn_failure",
            ScanError::ProcessError(_) => "process_error",
            ScanError::NotFound(_) => "not_found",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
