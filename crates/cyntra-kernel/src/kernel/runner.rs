//! Runner - the scheduling loop. Each cycle collects finished workcells,
//! refreshes readiness and admits new work.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};

use super::admission::Admission;
use super::dispatcher::Dispatcher;
use super::scheduler::{ScheduleResult, Scheduler};
use super::speculation::{resolve_votes, BatchState, Resolution, SpeculationEngine};
use crate::adapters::AdapterRegistry;
use crate::config::{FixIssuePolicy, KernelConfig};
use crate::error::{KernelError, Result};
use crate::observability::{EventEmitter, KernelEvent};
use crate::state::{Issue, IssueGraph, IssueStatus, IssueTracker, ReadinessChange};
use crate::workcell::{
    FailureReason, LaunchSpec, Recovery, Workcell, WorkcellId, WorkcellManager, WorkcellStatus,
};

/// How one collected workcell (or batch) affected its issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Done { workcell_id: WorkcellId },
    Retrying { attempts: u32 },
    FixIssue { fix_id: String },
    Escalated { fix_id: String },
    Reopened,
    /// The issue vanished from the tracker
    Skipped,
}

/// What a single cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub collected: Vec<(String, IssueOutcome)>,
    pub readiness_changes: Vec<ReadinessChange>,
    /// In-progress issues with no workcell, returned to `open`
    pub reopened: Vec<String>,
    pub schedule: ScheduleResult,
    pub launched: Vec<WorkcellId>,
    /// Contained per-issue failures
    pub errors: Vec<String>,
    /// Set when the cycle stopped early because the tracker was unreachable
    pub tracker_error: Option<String>,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        format!(
            "Collected: {}, Readiness: {}, Reopened: {}, Launched: {}, {}",
            self.collected.len(),
            self.readiness_changes.len(),
            self.reopened.len(),
            self.launched.len(),
            self.schedule.summary()
        )
    }
}

/// Drives scheduling cycles.
pub struct KernelRunner {
    config: KernelConfig,
    config_path: Option<PathBuf>,
    tracker: Arc<dyn IssueTracker>,
    manager: WorkcellManager,
    dispatcher: Dispatcher,
    speculation: SpeculationEngine,
    events: Arc<EventEmitter>,
    target: Option<String>,
}

impl KernelRunner {
    pub fn new(
        config: KernelConfig,
        tracker: Arc<dyn IssueTracker>,
        manager: WorkcellManager,
        registry: AdapterRegistry,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            config,
            config_path: None,
            tracker,
            manager,
            dispatcher: Dispatcher::new(registry),
            speculation: SpeculationEngine::new(),
            events,
            target: None,
        }
    }

    /// Reload configuration from `path` between cycles.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Restrict admission to a single issue.
    pub fn set_target(&mut self, issue_id: Option<String>) {
        self.target = issue_id;
    }

    pub fn manager(&self) -> &WorkcellManager {
        &self.manager
    }

    pub fn speculation(&self) -> &SpeculationEngine {
        &self.speculation
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Restore persisted workcell state. Call once before the first cycle.
    pub fn startup(&mut self) -> Result<Recovery> {
        let recovery = self.manager.recover()?;
        self.speculation.rebuild(&self.manager.snapshot());
        Ok(recovery)
    }

    /// One full cycle. Tracker outages end the cycle early and are reported;
    /// everything else is contained per issue.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.guarded_cycle(true).await
    }

    /// A cycle that applies verdicts and readiness but admits nothing.
    pub async fn collect_cycle(&mut self) -> CycleReport {
        self.guarded_cycle(false).await
    }

    async fn guarded_cycle(&mut self, admit: bool) -> CycleReport {
        let mut report = CycleReport::default();
        if let Err(e) = self.cycle(&mut report, admit).await {
            tracing::warn!(error = %e, "Cycle aborted; retrying next tick");
            self.events
                .record(KernelEvent::new("cycle.aborted", e.to_string()));
            report.tracker_error = Some(e.to_string());
        }
        report
    }

    async fn cycle(&mut self, report: &mut CycleReport, admit: bool) -> Result<()> {
        let snapshot = self.fetch_graph().await?;
        let mutated = self.collect(&snapshot, report).await?;

        let graph = if mutated {
            self.fetch_graph().await?
        } else {
            snapshot
        };
        let graph = if self.sync_statuses(&graph, report).await? {
            self.fetch_graph().await?
        } else {
            graph
        };
        let mutated = self.apply_readiness(&graph, report).await?;

        if !admit {
            return Ok(());
        }

        let graph = if mutated {
            self.fetch_graph().await?
        } else {
            graph
        };
        for (issue_id, blocker) in graph.dangling_blockers() {
            tracing::debug!(issue_id, blocker, "Blocker missing from tracker; treated as not done");
        }

        self.dispatcher.refresh().await;
        let busy = self.manager.busy_issues();
        report.schedule = Scheduler::new(&self.config)
            .with_target(self.target.as_deref())
            .schedule(&graph, self.manager.usage(), &busy, Utc::now());

        for admission in report.schedule.admitted.clone() {
            if let Some(issue) = graph.get(&admission.issue_id) {
                self.launch(issue, &admission, report).await?;
            }
        }

        tracing::info!("{}", report.summary());
        Ok(())
    }

    async fn fetch_graph(&self) -> Result<IssueGraph> {
        let issues = self
            .tracker
            .list_issues()
            .await
            .map_err(KernelError::tracker)?;
        Ok(IssueGraph::from_issues(issues))
    }

    /// Apply verdicts of finished workcells. Returns whether the tracker changed.
    async fn collect(&mut self, graph: &IssueGraph, report: &mut CycleReport) -> Result<bool> {
        let mut mutated = false;

        for workcell in self.manager.take_finished() {
            if workcell.speculative && self.speculation.is_speculating(&workcell.issue_id) {
                continue;
            }
            let outcome = self.apply_verdict(graph, &workcell).await?;
            self.manager.mark_collected(&workcell.id);
            report.collected.push((workcell.issue_id.clone(), outcome));
            mutated = true;
        }

        for (batch, variants) in self.speculation.ready_to_resolve(&self.manager) {
            let issue_id = batch.issue_id.clone();
            let resolution = resolve_votes(&batch, &variants, self.config.speculation.vote_threshold);
            let (outcome, state) = self.apply_resolution(graph, &issue_id, &variants, resolution).await?;
            for id in &batch.variants {
                self.manager.mark_collected(id);
            }
            self.speculation.finish(&issue_id, state);
            report.collected.push((issue_id, outcome));
            mutated = true;
        }

        Ok(mutated)
    }

    async fn apply_verdict(&self, graph: &IssueGraph, workcell: &Workcell) -> Result<IssueOutcome> {
        let Some(issue) = graph.get(&workcell.issue_id) else {
            tracing::warn!(
                issue_id = %workcell.issue_id,
                workcell_id = %workcell.id,
                "Issue no longer in tracker; dropping verdict"
            );
            return Ok(IssueOutcome::Skipped);
        };

        match workcell.status {
            WorkcellStatus::Completed => {
                self.mark_done(issue, "gates passed").await?;
                self.manager.release_sandbox(&workcell.id, true);
                self.manager.mark_merge_ready(&workcell.id);
                Ok(IssueOutcome::Done {
                    workcell_id: workcell.id.clone(),
                })
            }
            WorkcellStatus::Evicted => {
                if issue.status.is_active() {
                    self.reopen(issue, "workcell evicted").await?;
                }
                Ok(IssueOutcome::Reopened)
            }
            _ => {
                let reason = workcell.failure.clone().unwrap_or(FailureReason::Interrupted);
                let error = reason.to_error(&workcell.toolchain);

                if reason.is_adapter_level() {
                    let budget = issue.max_attempts_or(self.config.scheduling.max_attempts);
                    let attempts = self
                        .tracker
                        .record_attempt(&issue.id, budget)
                        .await
                        .map_err(KernelError::tracker)?;
                    if attempts < budget {
                        self.events.issue_transition(
                            &issue.id,
                            issue.status,
                            IssueStatus::Open,
                            &format!("retrying after: {error}"),
                        );
                        return Ok(IssueOutcome::Retrying { attempts });
                    }
                }

                let description = failure_description(workcell, &error);
                let fix_id = self.file_fix_issue(issue, &description).await?;
                Ok(IssueOutcome::FixIssue { fix_id })
            }
        }
    }

    async fn apply_resolution(
        &self,
        graph: &IssueGraph,
        issue_id: &str,
        variants: &[Workcell],
        resolution: Resolution,
    ) -> Result<(IssueOutcome, BatchState)> {
        let issue = graph.get(issue_id);

        match resolution {
            Resolution::Winner {
                winner,
                discarded,
                pass_fraction,
                ..
            } => {
                if let Some(issue) = issue {
                    self.mark_done(issue, &format!("speculation winner {winner}")).await?;
                }
                for id in &discarded {
                    self.manager.mark_discarded(id);
                    self.manager.release_sandbox(id, false);
                }
                self.manager.release_sandbox(&winner, true);
                self.manager.mark_merge_ready(&winner);
                self.events.record(
                    KernelEvent::new("speculation.resolved", format!("winner {winner}"))
                        .issue(issue_id)
                        .workcell(&winner)
                        .metadata(serde_json::json!({
                            "pass_fraction": pass_fraction,
                            "discarded": discarded,
                        })),
                );
                Ok((IssueOutcome::Done { workcell_id: winner }, BatchState::Resolved))
            }
            Resolution::Escalated {
                passed,
                total,
                pass_fraction,
            } => {
                let error = KernelError::SpeculationEscalated {
                    issue_id: issue_id.to_string(),
                    passed,
                    total,
                };
                let mut outcome = IssueOutcome::Skipped;
                if let Some(issue) = issue {
                    let description = escalation_description(&error, variants);
                    let fix = self
                        .tracker
                        .create_fix_issue(&issue.id, &description)
                        .await
                        .map_err(KernelError::tracker)?;
                    self.mark_failed(issue, &error.to_string()).await?;
                    outcome = IssueOutcome::Escalated { fix_id: fix.id };
                }
                for variant in variants.iter().filter(|w| w.passed()) {
                    self.manager.mark_discarded(&variant.id);
                    self.manager.release_sandbox(&variant.id, false);
                }
                self.events.record(
                    KernelEvent::new("speculation.escalated", error.to_string())
                        .issue(issue_id)
                        .metadata(serde_json::json!({ "pass_fraction": pass_fraction })),
                );
                Ok((outcome, BatchState::Escalated))
            }
            Resolution::Cancelled => {
                if let Some(issue) = issue.filter(|i| i.status.is_active()) {
                    self.reopen(issue, "speculation cancelled").await?;
                }
                for variant in variants {
                    self.manager.release_sandbox(&variant.id, false);
                }
                Ok((IssueOutcome::Reopened, BatchState::Escalated))
            }
        }
    }

    /// Keep issue status in step with workcells: `gating` while gates run,
    /// and back to `open` when nothing is working on an in-progress issue.
    async fn sync_statuses(&self, graph: &IssueGraph, report: &mut CycleReport) -> Result<bool> {
        let workcells = self.manager.snapshot();
        let busy: HashSet<&str> = workcells.iter().map(|w| w.issue_id.as_str()).collect();
        let mut mutated = false;

        for workcell in workcells.iter().filter(|w| w.status == WorkcellStatus::Gating && !w.speculative) {
            if graph
                .get(&workcell.issue_id)
                .is_some_and(|i| i.status == IssueStatus::InProgress)
                && self
                    .cas(&workcell.issue_id, IssueStatus::InProgress, IssueStatus::Gating, "gates running")
                    .await?
            {
                mutated = true;
            }
        }

        for issue in graph.all_issues().filter(|i| i.status.is_active()) {
            if busy.contains(issue.id.as_str()) {
                continue;
            }
            self.reopen(issue, "no live workcell").await?;
            report.reopened.push(issue.id.clone());
            mutated = true;
        }

        Ok(mutated)
    }

    /// Restore `ready` exactly when all blockers are done.
    async fn apply_readiness(&self, graph: &IssueGraph, report: &mut CycleReport) -> Result<bool> {
        let mut mutated = false;
        for change in graph.readiness_changes() {
            let why = match change.to {
                IssueStatus::Ready => "blockers done",
                _ => "new blocker",
            };
            if self.cas(&change.issue_id, change.from, change.to, why).await? {
                report.readiness_changes.push(change);
                mutated = true;
            }
        }
        Ok(mutated)
    }

    async fn launch(&mut self, issue: &Issue, admission: &Admission, report: &mut CycleReport) -> Result<()> {
        if !self
            .cas(&issue.id, issue.status, IssueStatus::InProgress, "admitted")
            .await?
        {
            tracing::info!(issue_id = %issue.id, "Issue changed underneath admission; skipping");
            return Ok(());
        }

        let launched = if admission.speculative() {
            let adapters = self.dispatcher.select_variants(issue, admission.variants);
            if adapters.is_empty() {
                Err(KernelError::NoAdapterAvailable(issue.id.clone()))
            } else {
                self.speculation
                    .launch(&self.manager, issue, adapters, admission.tokens_per_variant)
                    .map(|batch| batch.variants)
            }
        } else {
            match self.dispatcher.select(issue) {
                Some(adapter) => self
                    .manager
                    .create(LaunchSpec {
                        issue: issue.clone(),
                        adapter,
                        reserved_tokens: admission.tokens_per_variant,
                        speculative: false,
                    })
                    .map(|id| vec![id]),
                None => Err(KernelError::NoAdapterAvailable(issue.id.clone())),
            }
        };

        match launched {
            Ok(ids) => {
                report.launched.extend(ids);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(issue_id = %issue.id, error = %e, "Launch failed; issue stays ready");
                report.errors.push(e.to_string());
                self.cas(&issue.id, IssueStatus::InProgress, IssueStatus::Ready, "launch failed")
                    .await?;
                Ok(())
            }
        }
    }

    async fn cas(&self, id: &str, from: IssueStatus, to: IssueStatus, why: &str) -> Result<bool> {
        let changed = self
            .tracker
            .transition(id, from, to)
            .await
            .map_err(KernelError::tracker)?;
        if changed {
            self.events.issue_transition(id, from, to, why);
        }
        Ok(changed)
    }

    async fn mark_done(&self, issue: &Issue, why: &str) -> Result<()> {
        self.tracker
            .mark_done(&issue.id)
            .await
            .map_err(KernelError::tracker)?;
        self.events
            .issue_transition(&issue.id, issue.status, IssueStatus::Done, why);
        Ok(())
    }

    async fn mark_failed(&self, issue: &Issue, why: &str) -> Result<()> {
        self.tracker
            .mark_failed(&issue.id)
            .await
            .map_err(KernelError::tracker)?;
        self.events
            .issue_transition(&issue.id, issue.status, IssueStatus::BlockedFailed, why);
        Ok(())
    }

    async fn reopen(&self, issue: &Issue, why: &str) -> Result<()> {
        self.tracker
            .reopen(&issue.id)
            .await
            .map_err(KernelError::tracker)?;
        self.events
            .issue_transition(&issue.id, issue.status, IssueStatus::Open, why);
        Ok(())
    }

    /// Create a fix issue blocking `issue` and park the original per policy.
    async fn file_fix_issue(&self, issue: &Issue, description: &str) -> Result<String> {
        let fix = self
            .tracker
            .create_fix_issue(&issue.id, description)
            .await
            .map_err(KernelError::tracker)?;
        self.events.record(
            KernelEvent::new("issue.fix_created", format!("fix issue {} created", fix.id))
                .issue(&issue.id)
                .metadata(serde_json::json!({ "fix_issue": fix.id })),
        );

        match self.config.failure.fix_issue_policy {
            FixIssuePolicy::ReopenBlocked => self.reopen(issue, "blocked on fix issue").await?,
            FixIssuePolicy::MarkFailed => self.mark_failed(issue, "fix issue created").await?,
        }
        Ok(fix.id)
    }

    /// Re-read the config file if there is one. Invalid files are ignored.
    ///
    /// Toolchains and gates apply from the next launch. Paths and the base
    /// branch are bound at startup and keep their old values.
    pub fn reload_config(&mut self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let loaded = KernelConfig::load(path).and_then(|mut config| {
            if let Some(root) = path.parent().and_then(|p| p.parent()) {
                config.resolve_paths(root);
            }
            config.validate()?;
            Ok(config)
        });
        match loaded {
            Ok(mut config) => {
                let pinned = keep_restart_settings(&self.config, &mut config);
                if !pinned.is_empty() {
                    tracing::warn!(
                        settings = ?pinned,
                        "Config changes ignored until restart"
                    );
                }
                if config.toolchain_priority != self.config.toolchain_priority
                    || config.toolchains != self.config.toolchains
                {
                    tracing::info!("Toolchain settings changed; rebuilding adapters");
                    self.dispatcher.set_registry(AdapterRegistry::from_config(&config));
                }
                self.manager.set_gates(config.gates.clone());
                self.config = config;
            }
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %format!("{e:#}"),
                "Keeping previous config; reload failed"
            ),
        }
    }

    /// Run one cycle, wait for what it launched, then collect the results.
    pub async fn run_once(&mut self, drain_timeout: Duration) -> Vec<CycleReport> {
        let first = self.run_cycle().await;
        if !self.manager.drain(drain_timeout).await {
            tracing::warn!("Workcells still running after drain timeout");
        }
        let second = self.collect_cycle().await;
        vec![first, second]
    }

    /// Cycle until `shutdown` flips to true. `wake` triggers an early cycle.
    pub async fn run(&mut self, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_seconds = self.config.scheduling.poll_interval_seconds,
            "Kernel running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.reload_config();
            self.run_cycle().await;

            let interval = Duration::from_secs(self.config.scheduling.poll_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.manager.changed() => {}
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Evict everything still running and hand the issues back.
    pub async fn shutdown(&mut self) {
        let evicted = self.manager.evict_all();
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "Evicted active workcells for shutdown");
        }
        let mut report = CycleReport::default();
        match self.fetch_graph().await {
            Ok(graph) => {
                if let Err(e) = self.collect(&graph, &mut report).await {
                    tracing::warn!(error = %e, "Could not apply final verdicts; they stay pending");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not apply final verdicts; they stay pending"),
        }
    }
}

/// Copy startup-bound settings from `current` into `next`, returning the
/// names of the ones that differed.
fn keep_restart_settings(current: &KernelConfig, next: &mut KernelConfig) -> Vec<&'static str> {
    let mut pinned = Vec::new();
    let paths = [
        ("workcells_dir", &current.workcells_dir, &mut next.workcells_dir),
        ("state_dir", &current.state_dir, &mut next.state_dir),
        ("logs_dir", &current.logs_dir, &mut next.logs_dir),
        ("beads_dir", &current.beads_dir, &mut next.beads_dir),
        ("events_path", &current.events_path, &mut next.events_path),
    ];
    for (name, old, new) in paths {
        if old != new {
            *new = old.clone();
            pinned.push(name);
        }
    }
    if current.base_branch != next.base_branch {
        next.base_branch = current.base_branch.clone();
        pinned.push("base_branch");
    }
    pinned
}

fn failure_description(workcell: &Workcell, error: &KernelError) -> String {
    let mut description = format!(
        "Workcell {} for issue {} failed: {}\n",
        workcell.id, workcell.issue_id, error
    );
    if let Some(gate) = workcell.gate_results.iter().find(|g| !g.passed() && g.required) {
        description.push_str(&format!(
            "\nGate `{}` (`{}`) output: {}\n\n```\n{}\n```\n",
            gate.name,
            gate.command,
            gate.output_path.display(),
            gate.output_excerpt.trim_end()
        ));
    }
    description
}

fn escalation_description(error: &KernelError, variants: &[Workcell]) -> String {
    let mut description = format!("{error}\n\nVariants:\n");
    for variant in variants {
        let verdict = if variant.passed() {
            "pass".to_string()
        } else {
            variant
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| variant.status.to_string())
        };
        description.push_str(&format!("- {} ({}): {}\n", variant.id, variant.toolchain, verdict));
    }
    description
}
