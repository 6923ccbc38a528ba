//! Cyntra kernel CLI.
//!
//! - `cyntra-kernel run` - scheduling loop (once, or until Ctrl-C)
//! - `cyntra-kernel status` - issue graph and workcell summary
//! - `cyntra-kernel history` - finished workcells
//! - `cyntra-kernel workcell` - workcell management
//! - `cyntra-kernel init` - project scaffolding

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use notify::{RecursiveMode, Watcher};
use tokio::sync::{watch, Notify};
use tracing_subscriber::{fmt, EnvFilter};

use cyntra_kernel::adapters::AdapterRegistry;
use cyntra_kernel::config::DEFAULT_CONFIG_YAML;
use cyntra_kernel::kernel::CycleReport;
use cyntra_kernel::observability::{EventEmitter, KernelEvent, KernelStatus, WorkcellStatusEntry};
use cyntra_kernel::workcell::{GitWorktrees, Workcell, WorkcellStore, WorktreeProvider};
use cyntra_kernel::{BeadsTracker, IssueGraph, IssueTracker, KernelConfig, KernelRunner, WorkcellManager};

#[derive(Parser)]
#[command(name = "cyntra-kernel")]
#[command(about = "Schedules issues into isolated agent workcells", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the kernel
    Run {
        /// Run one cycle, wait for its workcells, apply verdicts and exit
        #[arg(long, conflicts_with = "watch")]
        once: bool,

        /// Also wake up when the issue files change
        #[arg(long)]
        watch: bool,

        /// Only admit this issue
        #[arg(long)]
        issue: Option<String>,

        /// Seconds `--once` waits for workcells before giving up
        #[arg(long, default_value_t = 3600)]
        drain_timeout: u64,
    },

    /// Show kernel status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show finished workcells
    History {
        /// Only this issue
        #[arg(long)]
        issue: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Workcell management
    Workcell {
        #[command(subcommand)]
        command: WorkcellCommands,
    },

    /// Initialize a new project
    Init,
}

#[derive(Subcommand)]
enum WorkcellCommands {
    /// List workcells the kernel still tracks
    Ls,

    /// Remove sandboxes left behind by finished workcells
    Cleanup {
        /// Also delete the workcells' logs
        #[arg(long)]
        remove_logs: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let project_root = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Init => init_project(&project_root),
        Commands::Run {
            once,
            watch,
            issue,
            drain_timeout,
        } => {
            let config = load_config(&project_root)?;
            run_kernel(&project_root, config, once, watch, issue, drain_timeout).await
        }
        Commands::Status { json } => show_status(&load_config(&project_root)?, json).await,
        Commands::History { issue, limit, json } => {
            show_history(&load_config(&project_root)?, issue.as_deref(), limit, json)
        }
        Commands::Workcell { command } => {
            handle_workcell(&project_root, &load_config(&project_root)?, command)
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Load, resolve and validate the project config. Invalid config is fatal.
fn load_config(project_root: &Path) -> Result<KernelConfig> {
    let mut config = KernelConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    config.validate()?;
    Ok(config)
}

async fn run_kernel(
    project_root: &Path,
    config: KernelConfig,
    once: bool,
    watch_files: bool,
    target: Option<String>,
    drain_timeout: u64,
) -> Result<()> {
    tracing::info!(project = %project_root.display(), "Starting kernel");

    let events = Arc::new(EventEmitter::new(&config.events_path));
    let tracker: Arc<dyn IssueTracker> = Arc::new(BeadsTracker::new(&config.beads_dir));
    let manager = WorkcellManager::from_config(&config, project_root, events.clone());
    let registry = AdapterRegistry::from_config(&config);
    if registry.is_empty() {
        tracing::warn!("No toolchains enabled; nothing will be launched");
    }
    let beads_dir = config.beads_dir.clone();

    let mut runner = KernelRunner::new(config, tracker, manager, registry, events.clone())
        .with_config_path(KernelConfig::project_config_path(project_root));
    runner.set_target(target);

    let recovery = runner.startup()?;
    if !recovery.interrupted.is_empty() {
        tracing::warn!(
            count = recovery.interrupted.len(),
            "Workcells were interrupted by the previous shutdown"
        );
    }
    events.record(KernelEvent::new("kernel.start", "Kernel started"));

    if once {
        for report in runner.run_once(Duration::from_secs(drain_timeout)).await {
            print_report(&report);
        }
    } else {
        let wake = Arc::new(Notify::new());
        let _watcher = if watch_files {
            Some(watch_issues(&beads_dir, wake.clone())?)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received; shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        runner.run(wake, shutdown_rx).await;
    }

    events.record(KernelEvent::new("kernel.stop", "Kernel stopped"));
    Ok(())
}

/// Wake the loop early whenever the issue files change.
fn watch_issues(beads_dir: &Path, wake: Arc<Notify>) -> Result<notify::RecommendedWatcher> {
    std::fs::create_dir_all(beads_dir)
        .with_context(|| format!("Failed to create {}", beads_dir.display()))?;
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) if !event.kind.is_access() => wake.notify_one(),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Issue file watcher error"),
    })?;
    watcher
        .watch(beads_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", beads_dir.display()))?;
    tracing::info!(path = %beads_dir.display(), "Watching issue files");
    Ok(watcher)
}

fn print_report(report: &CycleReport) {
    if let Some(error) = &report.tracker_error {
        println!("Cycle aborted: {error}");
        return;
    }
    println!("{}", report.summary());
    for (issue_id, outcome) in &report.collected {
        println!("  {issue_id}: {outcome:?}");
    }
    for id in &report.launched {
        println!("  launched {id}");
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
}

async fn show_status(config: &KernelConfig, json: bool) -> Result<()> {
    let tracker = BeadsTracker::new(&config.beads_dir);
    let graph = IssueGraph::from_issues(tracker.list_issues().await?);
    let workcells = tracked_workcells(config)?;
    let events = EventEmitter::new(&config.events_path);
    let status = KernelStatus::build(&graph, &workcells, events.read_recent(10));

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Cyntra Kernel Status");
    println!("====================");
    println!();
    let counts: Vec<String> = status
        .issue_counts
        .iter()
        .map(|(status, n)| format!("{status}: {n}"))
        .collect();
    println!("Issues: {}", counts.join(", "));
    println!();
    println!(
        "Workcells: {} active, {} tokens reserved (ceiling {})",
        status.active_workcells.len(),
        status.active_tokens,
        config.scheduling.max_concurrent_tokens
    );
    for entry in &status.active_workcells {
        print_workcell(entry);
    }
    println!();
    println!("Ready issues: {}", status.ready_issues.len());
    for id in status.ready_issues.iter().take(5) {
        let title = graph.get(id).map(|i| i.title.as_str()).unwrap_or_default();
        println!("  - {id} {title}");
    }
    if status.ready_issues.len() > 5 {
        println!("  ... and {} more", status.ready_issues.len() - 5);
    }
    if !status.critical_path.is_empty() {
        println!();
        println!("Critical path: {}", status.critical_path.join(" -> "));
    }
    println!();
    println!("Recent events:");
    for event in &status.recent_events {
        println!(
            "  {} [{}] {}",
            event.timestamp.format("%H:%M:%S"),
            event.event_type,
            event.message
        );
    }

    Ok(())
}

fn print_workcell(entry: &WorkcellStatusEntry) {
    println!(
        "  - {} (issue: {}, {}, {}, {}s, {} tokens{})",
        entry.workcell_id,
        entry.issue_id,
        entry.toolchain,
        entry.status,
        entry.elapsed_secs,
        entry.tokens_used.max(entry.reserved_tokens),
        if entry.speculative { ", speculative" } else { "" }
    );
}

/// Persisted records the kernel has not collected yet.
fn tracked_workcells(config: &KernelConfig) -> Result<Vec<Workcell>> {
    let store = WorkcellStore::new(&config.state_dir);
    Ok(store.load_all()?.into_iter().filter(|w| !w.collected).collect())
}

fn show_history(config: &KernelConfig, issue: Option<&str>, limit: usize, json: bool) -> Result<()> {
    let history = WorkcellStore::new(&config.state_dir).history(issue, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No finished workcells");
        return Ok(());
    }
    for workcell in &history {
        let finished = workcell
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let detail = match workcell.error() {
            Some(error) => error.to_string(),
            None if workcell.discarded => "passed, lost vote".to_string(),
            None => "passed".to_string(),
        };
        println!(
            "{finished}  {}  issue {}  {}  {}: {}",
            workcell.id, workcell.issue_id, workcell.toolchain, workcell.status, detail
        );
        for gate in &workcell.gate_results {
            println!(
                "    {} {:?} in {}ms ({})",
                gate.name,
                gate.outcome,
                gate.duration_ms,
                gate.output_path.display()
            );
        }
    }
    Ok(())
}

fn handle_workcell(project_root: &Path, config: &KernelConfig, command: WorkcellCommands) -> Result<()> {
    match command {
        WorkcellCommands::Ls => {
            let workcells = tracked_workcells(config)?;
            println!("Tracked workcells: {}", workcells.len());
            for workcell in &workcells {
                print_workcell(&WorkcellStatusEntry::from(workcell));
            }
        }
        WorkcellCommands::Cleanup { remove_logs } => {
            let sandboxes = GitWorktrees::new(project_root, &config.workcells_dir, &config.base_branch);
            let records = WorkcellStore::new(&config.state_dir).load_all()?;
            let mut cleaned = 0;
            for workcell in records.iter().filter(|w| w.status.is_terminal()) {
                if workcell.sandbox.path.exists() {
                    sandboxes
                        .release(&workcell.sandbox, workcell.merge_ready)
                        .with_context(|| format!("Failed to clean {}", workcell.id))?;
                    cleaned += 1;
                }
                if remove_logs {
                    let logs = config.logs_dir.join(workcell.id.as_str());
                    if logs.exists() {
                        std::fs::remove_dir_all(&logs)
                            .with_context(|| format!("Failed to remove {}", logs.display()))?;
                    }
                }
            }
            println!("Cleaned {cleaned} workcell sandboxes");
        }
    }
    Ok(())
}

fn init_project(project_root: &Path) -> Result<()> {
    let cyntra_dir = project_root.join(".cyntra");
    let beads_dir = project_root.join(".beads");

    std::fs::create_dir_all(&cyntra_dir)?;
    std::fs::create_dir_all(&beads_dir)?;

    let config_path = KernelConfig::project_config_path(project_root);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG_YAML)?;
    }

    let issues_path = beads_dir.join("issues.jsonl");
    if !issues_path.exists() {
        std::fs::write(&issues_path, "")?;
    }

    println!("Initialized Cyntra project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .cyntra/config.yaml - kernel configuration");
    println!("  .beads/issues.jsonl - work graph");
    println!();
    println!("Next steps:");
    println!("  1. Add issues to .beads/issues.jsonl");
    println!("  2. Run: cyntra-kernel run --once");

    Ok(())
}
