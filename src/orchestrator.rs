use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{self, Subscription};
use crate::catalog::{self, ToolDefinition, ToolKind};
use crate::command::{validate_domain, CommandBuilder, CommandLine, ToolSelection};
use crate::error::{Result, ScanError};
use crate::registry::ScanRegistry;
use crate::run::{RunStatus, ToolRun};
use crate::runner::{ProcessRunner, DEFAULT_STOP_GRACE};
use crate::types::{BatchPhase, BatchView, DomainScanState, ScanAck, StopSummary, ToolRunSummary};

/// Default number of tool processes allowed to execute at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on simultaneously executing runs, across all batches.
    pub max_concurrent_runs: usize,
    /// SIGTERM grace period before a stopped tool is killed.
    pub stop_grace: Duration,
    /// How long `stop_all` waits before declaring batches done anyway.
    pub stop_all_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            stop_grace: DEFAULT_STOP_GRACE,
            stop_all_timeout: DEFAULT_STOP_GRACE + Duration::from_secs(2),
        }
    }
}

/// One domain staged for scanning together with its per-tool choices.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanTarget {
    pub domain: String,
    #[serde(default)]
    pub tools: BTreeMap<ToolKind, ToolSelection>,
}

impl ScanTarget {
    /// Target running `tools` with no flags or inputs.
    pub fn new(domain: impl Into<String>, tools: impl IntoIterator<Item = ToolKind>) -> Self {
        Self {
            domain: domain.into(),
            tools: tools
                .into_iter()
                .map(|t| (t, ToolSelection::default()))
                .collect(),
        }
    }

    pub fn with_selection(mut self, tool: ToolKind, selection: ToolSelection) -> Self {
        self.tools.insert(tool, selection);
        self
    }
}

#[derive(Debug)]
struct Batch {
    id: Uuid,
    runs: Vec<Arc<ToolRun>>,
    phase: watch::Sender<BatchPhase>,
}

impl Batch {
    /// Phases only move forward; `done` is final.
    fn set_phase(&self, next: BatchPhase) {
        self.phase.send_if_modified(|phase| {
            if next <= *phase {
                return false;
            }
            *phase = next;
            true
        });
    }

    fn view(&self) -> BatchView {
        BatchView {
            batch_id: self.id,
            phase: *self.phase.borrow(),
            runs: self.runs.iter().map(|r| ToolRunSummary::of(r)).collect(),
        }
    }
}

/// Fans scan batches out into tool runs and routes stop requests.
///
/// Dispatch is FIFO over (domain, tool) pairs in request order, with at most
/// `max_concurrent_runs` processes alive at once. Runs are independent: one
/// failing or being stopped never cancels another.
#[derive(Debug)]
pub struct ScanOrchestrator {
    config: OrchestratorConfig,
    builder: CommandBuilder,
    runner: ProcessRunner,
    registry: Arc<ScanRegistry>,
    slots: Arc<Semaphore>,
    batches: RwLock<HashMap<Uuid, Arc<Batch>>>,
}

impl ScanOrchestrator {
    pub fn new(config: OrchestratorConfig, builder: CommandBuilder) -> Self {
        let runner = ProcessRunner::new(config.stop_grace);
        let slots = Arc::new(Semaphore::new(config.max_concurrent_runs.clamp(1, 1_000)));
        Self {
            registry: Arc::new(ScanRegistry::new(runner.clone())),
            runner,
            slots,
            builder,
            config,
            batches: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ScanRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> Vec<&'static ToolDefinition> {
        catalog::all()
    }

    /// The command `start_scan` would run for this tool and domain.
    pub fn preview(&self, tool: ToolKind, domain: &str, selection: &ToolSelection) -> Result<CommandLine> {
        self.builder.build_selection(tool, domain, selection)
    }

    /// Validate every target, register every run, and start dispatching.
    ///
    /// Nothing is registered unless every domain is valid, every command
    /// builds, and no (domain, tool) pair already has a live run. An empty
    /// request is not accepted.
    pub async fn start_scan(&self, targets: &[ScanTarget]) -> Result<ScanAck> {
        let mut seen = HashSet::new();
        let mut requests = Vec::new();
        for target in targets {
            let domain = validate_domain(&target.domain)?;
            if !seen.insert(domain.clone()) {
                continue;
            }
            for (tool, selection) in &target.tools {
                let command = self.builder.build_selection(*tool, &domain, selection)?;
                requests.push((domain.clone(), *tool, command));
            }
        }
        if requests.is_empty() {
            return Ok(ScanAck {
                accepted: false,
                batch_id: Uuid::nil(),
                runs: 0,
            });
        }

        let runs = self.registry.register_all(requests).await?;
        let batch = Arc::new(Batch {
            id: Uuid::new_v4(),
            runs,
            phase: watch::Sender::new(BatchPhase::Accepted),
        });
        self.batches
            .write()
            .await
            .insert(batch.id, batch.clone());
        info!(
            batch_id = %batch.id,
            domains = seen.len(),
            runs = batch.runs.len(),
            "scan batch accepted"
        );

        let ack = ScanAck {
            accepted: true,
            batch_id: batch.id,
            runs: batch.runs.len(),
        };
        tokio::spawn(dispatch(batch, self.slots.clone(), self.runner.clone()));
        Ok(ack)
    }

    pub async fn batch(&self, batch_id: Uuid) -> Result<BatchView> {
        Ok(self.find_batch(batch_id).await?.view())
    }

    /// Wait until the batch is done and return its final view.
    pub async fn wait_batch(&self, batch_id: Uuid) -> Result<BatchView> {
        let batch = self.find_batch(batch_id).await?;
        let mut rx = batch.phase.subscribe();
        // The sender lives in `batch`, which we hold.
        let _ = rx.wait_for(|p| *p == BatchPhase::Done).await;
        Ok(batch.view())
    }

    async fn find_batch(&self, batch_id: Uuid) -> Result<Arc<Batch>> {
        self.batches
            .read()
            .await
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(format!("batch {batch_id}")))
    }

    pub async fn domain_progress(&self, domain: &str) -> Result<DomainScanState> {
        self.registry.get_domain_state(&normalise(domain)).await
    }

    pub async fn list_domains(&self) -> Vec<String> {
        self.registry.list_domains().await
    }

    /// Attach a viewer to the current run of `tool` on `domain`.
    pub async fn stream_output(&self, domain: &str, tool: ToolKind) -> Result<Subscription> {
        let run = self.registry.find_run(&normalise(domain), tool).await?;
        Ok(broadcast::subscribe(&run))
    }

    /// Stop `tool` on one domain. Stopping a finished run succeeds as a no-op.
    pub async fn stop_tool_on(&self, domain: &str, tool: ToolKind) -> Result<StopSummary> {
        let run = self.registry.find_run(&normalise(domain), tool).await?;
        let live: Vec<_> = std::iter::once(run)
            .filter(|r| !r.status().is_terminal())
            .collect();
        Ok(self.stop_runs(live, self.runner.stop_deadline()).await)
    }

    /// Stop `tool` on every domain.
    pub async fn stop_tool(&self, tool: ToolKind) -> StopSummary {
        let live = self.registry.live_runs(None, Some(tool)).await;
        self.stop_runs(live, self.runner.stop_deadline()).await
    }

    /// Stop every live run, wait (bounded) for them, then mark all batches done.
    ///
    /// Only batches already accepted when the call begins are marked done.
    /// A batch is inserted after its runs are registered, so all of their
    /// runs are in the live-run snapshot taken next.
    pub async fn stop_all(&self) -> StopSummary {
        let batches: Vec<Arc<Batch>> = self.batches.read().await.values().cloned().collect();
        let live = self.registry.live_runs(None, None).await;
        let summary = self.stop_runs(live, self.config.stop_all_timeout).await;
        for batch in batches {
            batch.set_phase(BatchPhase::Done);
        }
        summary
    }

    async fn stop_runs(&self, runs: Vec<Arc<ToolRun>>, deadline: Duration) -> StopSummary {
        let stopped = runs.len();
        let mut stops = JoinSet::new();
        for run in runs {
            let runner = self.runner.clone();
            stops.spawn(async move { runner.stop(&run).await });
        }
        let all_ok = time::timeout(deadline, async {
            let mut ok = true;
            while let Some(res) = stops.join_next().await {
                ok &= res.unwrap_or(false);
            }
            ok
        })
        .await;
        let success = match all_ok {
            Ok(ok) => ok,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "stop request timed out");
                false
            }
        };
        info!(stopped, success, "stop request handled");
        StopSummary { success, stopped }
    }

    /// Clear finished runs; see [`ScanRegistry::clear`].
    pub async fn clear(&self, domain: Option<&str>, force: bool) -> Result<usize> {
        let domain = domain.map(normalise);
        let removed = self.registry.clear(domain.as_deref(), force).await?;
        self.prune_batches().await;
        Ok(removed)
    }

    /// Forget finished batches none of whose runs is still in the registry,
    /// so cleared runs and their logs are actually released.
    async fn prune_batches(&self) {
        let mut batches = self.batches.write().await;
        let mut stale = Vec::new();
        for (id, batch) in batches.iter() {
            if *batch.phase.borrow() != BatchPhase::Done
                || batch.runs.iter().any(|r| !r.status().is_terminal())
            {
                continue;
            }
            let mut referenced = false;
            for run in &batch.runs {
                if self.registry.contains(run.id()).await {
                    referenced = true;
                    break;
                }
            }
            if !referenced {
                stale.push(*id);
            }
        }
        for id in &stale {
            batches.remove(id);
        }
        if !stale.is_empty() {
            debug!(pruned = stale.len(), "finished batches released");
        }
    }
}

fn normalise(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

/// Launch the batch's runs in order as concurrency slots free up.
async fn dispatch(batch: Arc<Batch>, slots: Arc<Semaphore>, runner: ProcessRunner) {
    batch.set_phase(BatchPhase::Dispatching);
    let mut running = JoinSet::new();

    for run in &batch.runs {
        if run.status().is_terminal() {
            continue;
        }
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    run.cancel_pending();
                    continue;
                }
            },
            _ = run.cancel_token().cancelled() => {
                run.cancel_pending();
                continue;
            }
        };
        debug!(
            batch_id = %batch.id,
            domain = run.domain(),
            tool = %run.tool(),
            available = slots.available_permits(),
            "dispatching run"
        );
        let runner = runner.clone();
        let run = run.clone();
        running.spawn(async move {
            let _permit = permit; // released when the process is done
            runner.execute(&run).await
        });
    }

    batch.set_phase(BatchPhase::Running);
    while let Some(res) = running.join_next().await {
        if !matches!(res, Ok(RunStatus::Completed) | Ok(RunStatus::Stopped)) {
            batch.set_phase(BatchPhase::PartiallyFailed);
        }
    }
    for run in &batch.runs {
        if !run.status().is_terminal() && run.fail_with("runner task ended unexpectedly") {
            warn!(run_id = %run.id(), "run left without an owner");
        }
    }
    info!(batch_id = %batch.id, "scan batch done");
    batch.set_phase(BatchPhase::Done);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn orchestrator(max: usize) -> ScanOrchestrator {
        let builder = CommandBuilder::new().with_program(ToolKind::Nmap, "echo");
        ScanOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_runs: max,
                stop_grace: Duration::from_millis(500),
                stop_all_timeout: Duration::from_secs(5),
            },
            builder,
        )
    }

    #[tokio::test]
    async fn invalid_domain_rejects_whole_batch() {
        let orch = orchestrator(2);
        let err = orch
            .start_scan(&[
                ScanTarget::new("good.com", [ToolKind::Nmap]),
                ScanTarget::new("-bad.com", [ToolKind::Nmap]),
            ])
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::InvalidDomain("-bad.com".into()));
        assert!(orch.list_domains().await.is_empty());
    }

    #[tokio::test]
    async fn empty_request_not_accepted() {
        let orch = orchestrator(2);
        let ack = orch.start_scan(&[ScanTarget::new("a.com", [])]).await.unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.runs, 0);
    }

    #[tokio::test]
    async fn duplicate_domains_are_scanned_once() {
        let orch = orchestrator(2);
        let ack = orch
            .start_scan(&[
                ScanTarget::new("Example.com", [ToolKind::Nmap]),
                ScanTarget::new("example.com", [ToolKind::Nmap]),
            ])
            .await
            .unwrap();
        assert_eq!(ack.runs, 1);
        let view = orch.wait_batch(ack.batch_id).await.unwrap();
        assert_eq!(view.phase, BatchPhase::Done);
        assert_eq!(view.runs[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn clearing_a_domain_releases_its_finished_batch() {
        let orch = orchestrator(2);
        let a = orch
            .start_scan(&[ScanTarget::new("a.com", [ToolKind::Nmap])])
            .await
            .unwrap();
        let b = orch
            .start_scan(&[ScanTarget::new("b.com", [ToolKind::Nmap])])
            .await
            .unwrap();
        orch.wait_batch(a.batch_id).await.unwrap();
        orch.wait_batch(b.batch_id).await.unwrap();

        assert_eq!(orch.clear(Some("a.com"), false).await.unwrap(), 1);
        assert!(matches!(orch.batch(a.batch_id).await, Err(ScanError::NotFound(_))));
        assert_eq!(orch.batch(b.batch_id).await.unwrap().phase, BatchPhase::Done);
        assert_eq!(orch.batches.read().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_all_leaves_later_batches_running() {
        let builder = CommandBuilder::new().with_program(ToolKind::Nmap, "sleep");
        let orch = Arc::new(ScanOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_runs: 4,
                stop_grace: Duration::from_millis(500),
                stop_all_timeout: Duration::from_secs(5),
            },
            builder,
        ));
        let first = orch
            .start_scan(&[ScanTarget::new("30", [ToolKind::Nmap])])
            .await
            .unwrap();
        let run = orch.registry().find_run("30", ToolKind::Nmap).await.unwrap();
        let mut rx = run.watch();
        rx.wait_for(|s| s.status == RunStatus::Running).await.unwrap();

        // Accept a second batch while the stop is waiting on the first run.
        let stopping = tokio::spawn({
            let orch = orch.clone();
            async move { orch.stop_all().await }
        });
        tokio::task::yield_now().await;
        let second = orch
            .start_scan(&[ScanTarget::new("31", [ToolKind::Nmap])])
            .await
            .unwrap();
        let summary = stopping.await.unwrap();
        assert!(summary.success);

        assert_eq!(orch.batch(first.batch_id).await.unwrap().phase, BatchPhase::Done);
        let later = orch.batch(second.batch_id).await.unwrap();
        if later.phase == BatchPhase::Done {
            assert!(later.runs.iter().all(|r| r.status.is_terminal()), "{later:?}");
        }
        orch.stop_all().await;
    }

    #[tokio::test]
    async fn queued_runs_can_be_stopped_before_dispatch() {
        let builder = CommandBuilder::new().with_program(ToolKind::Nmap, "sleep");
        let orch = ScanOrchestrator::new(
            OrchestratorConfig {
                max_concurrent_runs: 1,
                stop_grace: Duration::from_millis(500),
                stop_all_timeout: Duration::from_secs(5),
            },
            builder,
        );
        // `sleep 30` via the nmap template's single domain argument.
        let ack = orch
            .start_scan(&[ScanTarget::new("30", [ToolKind::Nmap]), ScanTarget::new("31", [ToolKind::Nmap])])
            .await
            .unwrap();
        assert!(ack.accepted);

        let first = orch.registry().find_run("30", ToolKind::Nmap).await.unwrap();
        let mut rx = first.watch();
        rx.wait_for(|s| s.status == RunStatus::Running).await.unwrap();
        let second = orch.registry().find_run("31", ToolKind::Nmap).await.unwrap();
        assert_eq!(second.status(), RunStatus::Pending);

        let started = Instant::now();
        let summary = orch.stop_all().await;
        assert!(summary.success);
        assert_eq!(summary.stopped, 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(first.status(), RunStatus::Stopped);
        assert_eq!(second.status(), RunStatus::Stopped);
        assert!(second.snapshot().started_at.is_none());
        assert_eq!(orch.batch(ack.batch_id).await.unwrap().phase, BatchPhase::Done);
    }
}
