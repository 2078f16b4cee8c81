use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use domscan_rs::broadcast::StreamEvent;
use domscan_rs::catalog::ToolKind;
use domscan_rs::command::CommandBuilder;
use domscan_rs::orchestrator::{OrchestratorConfig, ScanOrchestrator, ScanTarget};
use domscan_rs::server;
use domscan_rs::types::ToolRunView;

/// domscan-rs: run nmap, sqlmap, XSStrike and gobuster against domains and watch their output live.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "domscan-rs",
    version,
    about = "Run several security scanners against domains and stream their output live.",
    long_about = None
)]
struct Cli {
    /// Address for the HTTP API and UI.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Start the HTTP API server and keep running until Ctrl+C.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Max tool processes executing at once.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Grace period between SIGTERM and SIGKILL when stopping a tool.
    #[arg(long = "grace-ms", default_value_t = 5000)]
    grace_ms: u64,

    /// Bounded wait for stop-all (default: grace + 2000).
    #[arg(long = "stop-all-timeout-ms")]
    stop_all_timeout_ms: Option<u64>,

    /// Executable override, e.g. `--tool gobuster=/opt/gobuster/bin/gobuster`. Repeatable.
    #[arg(long = "tool", value_parser = parse_tool_override)]
    tool_overrides: Vec<(ToolKind, String)>,

    /// Directory served as the web UI.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Domains to scan once from the command line (comma-separated).
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// Tools to run against every domain (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "nmap")]
    tools: Vec<ToolKind>,

    /// Write per-run results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_tool_override(s: &str) -> Result<(ToolKind, String)> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <tool>=<path>, got '{s}'"))?;
    let tool: ToolKind = name.parse()?;
    let path = path.trim();
    if path.is_empty() {
        bail!("empty executable path for {tool}");
    }
    Ok((tool, path.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let grace = Duration::from_millis(cli.grace_ms);
    let config = OrchestratorConfig {
        max_concurrent_runs: cli.concurrency.max(1),
        stop_grace: grace,
        stop_all_timeout: cli
            .stop_all_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(grace + Duration::from_secs(2)),
    };

    println!("domscan-rs configuration:");
    println!("  bind         : {}", cli.bind);
    println!("  serve        : {}", cli.serve);
    println!("  concurrency  : {}", config.max_concurrent_runs);
    println!("  grace_ms     : {}", cli.grace_ms);
    println!("  stop_all_ms  : {}", config.stop_all_timeout.as_millis());
    for (tool, path) in &cli.tool_overrides {
        println!("  tool         : {tool} -> {path}");
    }
    println!("  ui_dir       : {}", cli.ui_dir.display());
    if !cli.domains.is_empty() {
        println!("  domains      : {}", cli.domains.join(","));
        let tools: Vec<&str> = cli.tools.iter().map(|t| t.as_str()).collect();
        println!("  tools        : {}", tools.join(","));
    }
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let builder = cli
        .tool_overrides
        .iter()
        .fold(CommandBuilder::new(), |b, (tool, path)| {
            b.with_program(*tool, path.clone())
        });
    let orchestrator = Arc::new(ScanOrchestrator::new(config, builder));

    if !cli.domains.is_empty() {
        run_once(&orchestrator, &cli).await?;
    }

    if cli.serve {
        println!("Serving API on http://{} (Ctrl+C to stop)", cli.bind);
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        server::spawn_server(&cli.bind, orchestrator.clone(), cli.ui_dir.clone(), shutdown).await?;
        let summary = orchestrator.stop_all().await;
        if summary.stopped > 0 {
            println!("Stopped {} running tool(s)", summary.stopped);
        }
    } else if cli.domains.is_empty() {
        println!("\nNothing to do: pass --domains to scan once or --serve to start the API.");
    }

    Ok(())
}

/// Scan `--domains` with `--tools` in-process, echoing every line as it arrives.
async fn run_once(orchestrator: &Arc<ScanOrchestrator>, cli: &Cli) -> Result<()> {
    let targets: Vec<ScanTarget> = cli
        .domains
        .iter()
        .map(|d| ScanTarget::new(d.clone(), cli.tools.iter().copied()))
        .collect();
    let ack = orchestrator.start_scan(&targets).await?;
    if !ack.accepted {
        bail!("no tool runs requested");
    }
    println!("\nStarted {} run(s) (batch {})", ack.runs, ack.batch_id);

    let batch = orchestrator.batch(ack.batch_id).await?;
    let mut printers = JoinSet::new();
    for summary in &batch.runs {
        let mut sub = orchestrator.registry().subscribe(summary.run_id).await?;
        let prefix = format!("[{}/{}]", summary.domain, summary.tool);
        printers.spawn(async move {
            while let Some(event) = sub.next().await {
                if let StreamEvent::Line { line } = event {
                    println!("{prefix} {line}");
                }
            }
        });
    }

    let finished = tokio::select! {
        view = orchestrator.wait_batch(ack.batch_id) => view?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, stopping running tools...");
            orchestrator.stop_all().await;
            orchestrator.batch(ack.batch_id).await?
        }
    };
    while printers.join_next().await.is_some() {}

    let mut views = Vec::with_capacity(finished.runs.len());
    for summary in &finished.runs {
        let run = orchestrator.registry().get_run(summary.run_id).await?;
        views.push(ToolRunView::of(&run));
    }
    print_results_table(&views);
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &views) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

fn print_results_table(runs: &[ToolRunView]) {
    let mut domain_w = "domain".len();
    for r in runs {
        domain_w = domain_w.max(r.domain.len());
    }
    let tool_w = "xsstrike".len();
    let status_w = "completed".len();
    let exit_w = "exit".len();
    let lines_w = "lines".len();

    println!("\nRuns: {}", runs.len());
    println!(
        "{:<domain_w$}  {:<tool_w$}  {:<status_w$}  {:>exit_w$}  {:>lines_w$}",
        "domain", "tool", "status", "exit", "lines",
    );
    println!(
        "{:-<domain_w$}  {:-<tool_w$}  {:-<status_w$}  {:-<exit_w$}  {:-<lines_w$}",
        "", "", "", "", "",
    );
    for r in runs {
        let status = serde_json::to_value(r.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let exit = r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<domain_w$}  {:<tool_w$}  {:<status_w$}  {:>exit_w$}  {:>lines_w$}",
            r.domain,
            r.tool.as_str(),
            status,
            exit,
            r.output.len(),
        );
    }
}

fn write_results_json(path: &Path, runs: &[ToolRunView]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, runs)?;
    Ok(())
}
