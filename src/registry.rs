use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::info;

use crate::broadcast::{self, Subscription};
use crate::catalog::ToolKind;
use crate::command::CommandLine;
use crate::error::{Result, ScanError};
use crate::run::{RunId, RunStatus, ToolRun};
use crate::runner::ProcessRunner;
use crate::types::DomainScanState;

/// Single source of truth for every run of every domain.
///
/// Each domain holds at most one run per tool. A new run for a pair whose
/// previous run is terminal replaces it; a pair with a live run rejects new
/// runs with [`ScanError::RunAlreadyActive`].
#[derive(Debug)]
pub struct ScanRegistry {
    inner: RwLock<RegistryState>,
    runner: ProcessRunner,
}

#[derive(Debug, Default)]
struct RegistryState {
    domains: BTreeMap<String, BTreeMap<ToolKind, Arc<ToolRun>>>,
    runs: HashMap<RunId, Arc<ToolRun>>,
}

impl RegistryState {
    fn check_free(&self, domain: &str, tool: ToolKind) -> Result<()> {
        let busy = self
            .domains
            .get(domain)
            .and_then(|tools| tools.get(&tool))
            .is_some_and(|run| !run.status().is_terminal());
        if busy {
            return Err(ScanError::RunAlreadyActive {
                domain: domain.to_string(),
                tool,
            });
        }
        Ok(())
    }

    fn insert(&mut self, run: Arc<ToolRun>) {
        let previous = self
            .domains
            .entry(run.domain().to_string())
            .or_default()
            .insert(run.tool(), run.clone());
        if let Some(previous) = previous {
            self.runs.remove(&previous.id());
        }
        self.runs.insert(run.id(), run);
    }

    fn domain(&self, domain: &str) -> Result<&BTreeMap<ToolKind, Arc<ToolRun>>> {
        self.domains
            .get(domain)
            .ok_or_else(|| ScanError::NotFound(format!("domain {domain}")))
    }
}

impl ScanRegistry {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
            runner,
        }
    }

    /// Register one pending run for (domain, tool).
    pub async fn register_run(
        &self,
        domain: &str,
        tool: ToolKind,
        command: CommandLine,
    ) -> Result<Arc<ToolRun>> {
        let mut runs = self.register_all(vec![(domain.to_string(), tool, command)]).await?;
        // register_all returns one run per request
        runs.pop()
            .ok_or_else(|| ScanError::NotFound(format!("{tool} run for {domain}")))
    }

    /// Register several runs atomically: either every pair is free and all
    /// are inserted, or nothing changes.
    pub async fn register_all(
        &self,
        requests: Vec<(String, ToolKind, CommandLine)>,
    ) -> Result<Vec<Arc<ToolRun>>> {
        let mut state = self.inner.write().await;
        for (i, (domain, tool, _)) in requests.iter().enumerate() {
            state.check_free(domain, *tool)?;
            if requests[..i]
                .iter()
                .any(|(d, t, _)| d == domain && t == tool)
            {
                return Err(ScanError::RunAlreadyActive {
                    domain: domain.clone(),
                    tool: *tool,
                });
            }
        }
        let runs: Vec<Arc<ToolRun>> = requests
            .into_iter()
            .map(|(domain, tool, command)| Arc::new(ToolRun::new(domain, tool, command)))
            .collect();
        for run in &runs {
            state.insert(run.clone());
        }
        Ok(runs)
    }

    pub async fn get_domain_state(&self, domain: &str) -> Result<DomainScanState> {
        let state = self.inner.read().await;
        let tools = state.domain(domain)?;
        Ok(DomainScanState::compute(domain, tools.values().map(|r| r.as_ref())))
    }

    pub async fn list_domains(&self) -> Vec<String> {
        self.inner.read().await.domains.keys().cloned().collect()
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Arc<ToolRun>> {
        self.inner
            .read()
            .await
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(format!("run {run_id}")))
    }

    pub async fn contains(&self, run_id: RunId) -> bool {
        self.inner.read().await.runs.contains_key(&run_id)
    }

    pub async fn find_run(&self, domain: &str, tool: ToolKind) -> Result<Arc<ToolRun>> {
        let state = self.inner.read().await;
        state
            .domain(domain)?
            .get(&tool)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(format!("{tool} run for {domain}")))
    }

    /// Runs that have not reached a terminal status, optionally filtered.
    pub async fn live_runs(&self, domain: Option<&str>, tool: Option<ToolKind>) -> Vec<Arc<ToolRun>> {
        let state = self.inner.read().await;
        state
            .domains
            .iter()
            .filter(|(d, _)| domain.map_or(true, |wanted| wanted == d.as_str()))
            .flat_map(|(_, tools)| tools.values())
            .filter(|run| tool.map_or(true, |wanted| wanted == run.tool()))
            .filter(|run| !run.status().is_terminal())
            .cloned()
            .collect()
    }

    /// Apply a status change to a run through its compare-and-set guard.
    /// Returns whether the transition took effect.
    pub async fn record_status(&self, run_id: RunId, status: RunStatus) -> Result<bool> {
        let run = self.get_run(run_id).await?;
        let applied = match status {
            RunStatus::Pending => false,
            RunStatus::Starting | RunStatus::Running => run.advance(status),
            RunStatus::Stopped if run.status() == RunStatus::Pending => run.cancel_pending(),
            terminal => run.finish(terminal, None),
        };
        Ok(applied)
    }

    /// Subscribe to a run's output by id.
    pub async fn subscribe(&self, run_id: RunId) -> Result<Subscription> {
        let run = self.get_run(run_id).await?;
        Ok(broadcast::subscribe(&run))
    }

    /// Remove terminal runs of `domain` (or of every domain when `None`).
    ///
    /// Live runs block the clear with [`ScanError::ActiveScanInProgress`]
    /// unless `force` is set, in which case they are stopped first.
    /// Returns the number of runs removed.
    pub async fn clear(&self, domain: Option<&str>, force: bool) -> Result<usize> {
        if let Some(d) = domain {
            self.inner.read().await.domain(d)?;
        }

        let live = self.live_runs(domain, None).await;
        if !live.is_empty() {
            if !force {
                let busy = domain.unwrap_or_else(|| live[0].domain());
                return Err(ScanError::ActiveScanInProgress(busy.to_string()));
            }
            let mut stops = JoinSet::new();
            for run in live {
                let runner = self.runner.clone();
                stops.spawn(async move { runner.stop(&run).await });
            }
            while stops.join_next().await.is_some() {}
        }

        let mut state = self.inner.write().await;
        let RegistryState { domains, runs } = &mut *state;
        let mut removed = 0usize;
        domains.retain(|name, tools| {
            if domain.is_some_and(|d| d != name.as_str()) {
                return true;
            }
            tools.retain(|_, run| {
                let keep = !run.status().is_terminal();
                if !keep {
                    runs.remove(&run.id());
                    removed += 1;
                }
                keep
            });
            !tools.is_empty()
        });
        info!(domain = domain.unwrap_or("*"), removed, force, "registry cleared");
        Ok(removed)
    }
}
