//! Workcell lifecycle - sandbox acquisition, toolchain run, gating, eviction.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use super::{
    FailureReason, GitWorktrees, Sandbox, Workcell, WorkcellId, WorkcellStatus, WorkcellStore,
    WorktreeProvider,
};
use crate::adapters::{AdapterOutcome, InvocationRequest, ToolchainAdapter};
use crate::config::{GatesConfig, KernelConfig};
use crate::error::{KernelError, Result};
use crate::kernel::{Usage, Verdict, Verifier};
use crate::observability::EventEmitter;
use crate::state::Issue;

/// Slack on top of the adapter's own timeout before the task gives up on it.
const ADAPTER_GRACE: Duration = Duration::from_secs(5);

/// What to start for an admitted issue.
pub struct LaunchSpec {
    pub issue: Issue,
    pub adapter: Arc<dyn ToolchainAdapter>,
    pub reserved_tokens: u64,
    pub speculative: bool,
}

/// Owns workcell state transitions.
///
/// Every transition happens under one lock together with the record that the
/// admission view is computed from, and is persisted before the lock drops.
#[derive(Clone)]
pub struct WorkcellManager {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ManagerState>,
    store: WorkcellStore,
    sandboxes: Arc<dyn WorktreeProvider>,
    events: Arc<EventEmitter>,
    logs_dir: PathBuf,
    changed: Notify,
}

struct ManagerState {
    /// Active and not-yet-collected workcells
    cells: BTreeMap<WorkcellId, Workcell>,
    tasks: HashMap<WorkcellId, AbortHandle>,
    next_seq: u64,
    verifier: Verifier,
}

/// Outcome of startup recovery.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Workcells that were in flight when the kernel stopped
    pub interrupted: Vec<WorkcellId>,
    /// Terminal workcells whose verdict still has to be applied
    pub uncollected: usize,
}

impl WorkcellManager {
    pub fn new(
        store: WorkcellStore,
        sandboxes: Arc<dyn WorktreeProvider>,
        events: Arc<EventEmitter>,
        gates: GatesConfig,
        logs_dir: &Path,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    cells: BTreeMap::new(),
                    tasks: HashMap::new(),
                    next_seq: 1,
                    verifier: Verifier::new(gates, logs_dir),
                }),
                store,
                sandboxes,
                events,
                logs_dir: logs_dir.to_path_buf(),
                changed: Notify::new(),
            }),
        }
    }

    /// Manager backed by git worktrees of `repo_root`.
    pub fn from_config(config: &KernelConfig, repo_root: &Path, events: Arc<EventEmitter>) -> Self {
        let sandboxes = GitWorktrees::new(repo_root, &config.workcells_dir, &config.base_branch);
        Self::new(
            WorkcellStore::new(&config.state_dir),
            Arc::new(sandboxes),
            events,
            config.gates.clone(),
            &config.logs_dir,
        )
    }

    /// Apply a new gate configuration to workcells launched from now on.
    pub fn set_gates(&self, gates: GatesConfig) {
        let mut state = self.shared.lock();
        state.verifier = Verifier::new(gates, &self.shared.logs_dir);
    }

    /// Reload persisted records after a restart.
    ///
    /// In-flight workcells cannot be resumed: they are failed as
    /// `Interrupted` and their sandboxes released.
    pub fn recover(&self) -> Result<Recovery> {
        let records = self
            .shared
            .store
            .load_all()
            .map_err(|e| KernelError::Persistence(format!("{e:#}")))?;

        let mut recovery = Recovery::default();
        let mut due = Vec::new();
        {
            let mut state = self.shared.lock();
            for mut workcell in records {
                state.next_seq = state.next_seq.max(workcell.seq + 1);
                if workcell.collected {
                    continue;
                }
                if workcell.is_active() {
                    let from = workcell.status;
                    workcell.status = WorkcellStatus::Failed;
                    workcell.failure = Some(FailureReason::Interrupted);
                    workcell.finished_at = Some(Utc::now());
                    self.shared.persist(&workcell);
                    self.shared
                        .events
                        .workcell_transition(&workcell, Some(from), "interrupted by restart");
                    recovery.interrupted.push(workcell.id.clone());
                }
                recovery.uncollected += 1;
                due.push(workcell.id.clone());
                state.cells.insert(workcell.id.clone(), workcell);
            }
        }

        for id in due {
            self.release_if_due(&id);
        }

        if !recovery.interrupted.is_empty() || recovery.uncollected > 0 {
            tracing::info!(
                interrupted = recovery.interrupted.len(),
                uncollected = recovery.uncollected,
                "Recovered workcell state"
            );
        }
        Ok(recovery)
    }

    /// Active workcell count and charged tokens.
    pub fn usage(&self) -> Usage {
        let state = self.shared.lock();
        state
            .cells
            .values()
            .filter(|w| w.is_active())
            .fold(Usage::default(), |usage, w| Usage {
                active_workcells: usage.active_workcells + 1,
                active_tokens: usage.active_tokens + w.charged_tokens(),
            })
    }

    /// Issues with an active or uncollected workcell.
    pub fn busy_issues(&self) -> HashSet<String> {
        let state = self.shared.lock();
        state.cells.values().map(|w| w.issue_id.clone()).collect()
    }

    pub fn has_active(&self) -> bool {
        self.usage().active_workcells > 0
    }

    pub fn get(&self, id: &WorkcellId) -> Option<Workcell> {
        self.shared.lock().cells.get(id).cloned()
    }

    /// Active and uncollected workcells.
    pub fn snapshot(&self) -> Vec<Workcell> {
        self.shared.lock().cells.values().cloned().collect()
    }

    /// Terminal workcells whose verdict has not been applied yet.
    pub fn take_finished(&self) -> Vec<Workcell> {
        self.shared
            .lock()
            .cells
            .values()
            .filter(|w| w.status.is_terminal() && !w.collected)
            .cloned()
            .collect()
    }

    /// Acquire a sandbox, record the workcell and start its toolchain.
    pub fn create(&self, spec: LaunchSpec) -> Result<WorkcellId> {
        let issue_id = spec.issue.id.clone();
        let (id, seq, verifier) = {
            let mut state = self.shared.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            (WorkcellId::new(&issue_id, seq), seq, state.verifier.clone())
        };

        let sandbox = blocking(|| self.shared.sandboxes.acquire(&issue_id, &id))
            .map_err(|e| KernelError::SandboxAcquisitionFailed {
                issue_id: issue_id.clone(),
                detail: format!("{e:#}"),
            })?;

        let request = InvocationRequest {
            workcell_id: id.clone(),
            issue_id: issue_id.clone(),
            sandbox_path: sandbox.path.clone(),
            prompt: spec.issue.description(),
            timeout: spec.adapter.timeout(),
            log_dir: self.shared.logs_dir.join(id.as_str()),
        };

        let mut workcell = Workcell {
            id: id.clone(),
            seq,
            issue_id,
            sandbox,
            toolchain: spec.adapter.name().to_string(),
            status: WorkcellStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            reserved_tokens: spec.reserved_tokens,
            tokens_used: 0,
            gate_results: Vec::new(),
            verdict: None,
            failure: None,
            speculative: spec.speculative,
            sandbox_released: false,
            collected: false,
            merge_ready: false,
            discarded: false,
        };

        let mut state = self.shared.lock();
        self.shared.persist(&workcell);
        self.shared.events.workcell_transition(&workcell, None, "created");

        workcell.status = WorkcellStatus::Running;
        workcell.started_at = Some(Utc::now());
        self.shared.persist(&workcell);
        self.shared.events.workcell_transition(
            &workcell,
            Some(WorkcellStatus::Created),
            "toolchain started",
        );
        state.cells.insert(id.clone(), workcell);

        let adapter_name = spec.adapter.name().to_string();
        let work = run_workcell(self.clone(), id.clone(), spec.adapter, request, verifier);
        let task = tokio::spawn(contain_panics(self.clone(), id.clone(), adapter_name, work));
        state.tasks.insert(id.clone(), task.abort_handle());

        Ok(id)
    }

    /// Force an active workcell to `evicted` and release its sandbox.
    ///
    /// Returns false (and does nothing) if the workcell is not active.
    pub fn evict(&self, id: &WorkcellId) -> bool {
        let evicted = {
            let mut state = self.shared.lock();
            let task = state.tasks.remove(id);
            match state.cells.get_mut(id) {
                Some(workcell) if workcell.is_active() => {
                    if let Some(task) = task {
                        task.abort();
                    }
                    let from = workcell.status;
                    workcell.status = WorkcellStatus::Evicted;
                    workcell.finished_at = Some(Utc::now());
                    self.shared.persist(workcell);
                    self.shared.events.workcell_transition(workcell, Some(from), "evicted");
                    true
                }
                _ => false,
            }
        };

        if evicted {
            self.release_if_due(id);
            self.shared.changed.notify_waiters();
        }
        evicted
    }

    /// Evict every active workcell.
    pub fn evict_all(&self) -> Vec<WorkcellId> {
        let active: Vec<WorkcellId> = self
            .shared
            .lock()
            .cells
            .values()
            .filter(|w| w.is_active())
            .map(|w| w.id.clone())
            .collect();
        active.into_iter().filter(|id| self.evict(id)).collect()
    }

    /// Release a terminal workcell's sandbox. Returns false if it was already
    /// released (or unknown).
    pub fn release_sandbox(&self, id: &WorkcellId, keep_branch: bool) -> bool {
        let claimed = {
            let mut state = self.shared.lock();
            match state.cells.get_mut(id) {
                Some(workcell) if workcell.status.is_terminal() && !workcell.sandbox_released => {
                    workcell.sandbox_released = true;
                    self.shared.persist(workcell);
                    Some(workcell.sandbox.clone())
                }
                _ => None,
            }
        };

        match claimed {
            Some(sandbox) => {
                self.shared.release(id, &sandbox, keep_branch);
                true
            }
            None => false,
        }
    }

    /// Release now unless a speculation vote still needs the sandbox.
    fn release_if_due(&self, id: &WorkcellId) {
        let keep_branch = {
            let state = self.shared.lock();
            let Some(workcell) = state.cells.get(id) else {
                return;
            };
            match workcell.status {
                WorkcellStatus::Completed if workcell.speculative => return,
                WorkcellStatus::Completed => true,
                WorkcellStatus::Failed | WorkcellStatus::Evicted => false,
                _ => return,
            }
        };
        self.release_sandbox(id, keep_branch);
    }

    pub fn mark_merge_ready(&self, id: &WorkcellId) {
        self.shared.update(id, |w| w.merge_ready = true);
    }

    /// Passing speculative variant that lost the vote.
    pub fn mark_discarded(&self, id: &WorkcellId) {
        self.shared.update(id, |w| w.discarded = true);
    }

    /// The verdict has been applied to the tracker; forget the workcell.
    pub fn mark_collected(&self, id: &WorkcellId) {
        let mut state = self.shared.lock();
        if let Some(mut workcell) = state.cells.remove(id) {
            workcell.collected = true;
            self.shared.persist(&workcell);
        }
    }

    /// Resolves on the next workcell state change.
    pub async fn changed(&self) {
        self.shared.changed.notified().await;
    }

    /// Wait until no workcell is active. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.has_active() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.has_active();
            }
        }
    }

    /// Fail a workcell whose task died without reaching a terminal state.
    fn fail_abandoned(&self, id: &WorkcellId, reason: FailureReason) {
        let Some(status) = self.get(id).map(|w| w.status).filter(|s| s.is_active()) else {
            return;
        };
        self.transition(id, status, "workcell task panicked", |w| {
            w.status = WorkcellStatus::Failed;
            w.failure = Some(reason);
        });
    }

    /// Move `id` from `expected` to whatever `apply` sets. No-op if the
    /// workcell already left `expected` (evicted underneath us).
    fn transition(
        &self,
        id: &WorkcellId,
        expected: WorkcellStatus,
        message: &str,
        apply: impl FnOnce(&mut Workcell),
    ) -> bool {
        let terminal = {
            let mut state = self.shared.lock();
            let Some(workcell) = state.cells.get_mut(id) else {
                return false;
            };
            if workcell.status != expected {
                return false;
            }
            apply(workcell);
            let terminal = workcell.status.is_terminal();
            if terminal {
                workcell.finished_at = Some(Utc::now());
            }
            self.shared.persist(workcell);
            self.shared
                .events
                .workcell_transition(workcell, Some(expected), message);
            if terminal {
                state.tasks.remove(id);
            }
            terminal
        };

        if terminal {
            self.release_if_due(id);
            self.shared.changed.notify_waiters();
        }
        true
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, workcell: &Workcell) {
        if let Err(e) = self.store.save(workcell) {
            tracing::error!(
                workcell_id = %workcell.id,
                error = %format!("{e:#}"),
                "Failed to persist workcell record"
            );
        }
    }

    fn update(&self, id: &WorkcellId, apply: impl FnOnce(&mut Workcell)) {
        let mut state = self.lock();
        if let Some(workcell) = state.cells.get_mut(id) {
            apply(workcell);
            self.persist(workcell);
        }
    }

    fn release(&self, id: &WorkcellId, sandbox: &Sandbox, keep_branch: bool) {
        match blocking(|| self.sandboxes.release(sandbox, keep_branch)) {
            Ok(()) => tracing::debug!(workcell_id = %id, keep_branch, "Sandbox released"),
            Err(e) => tracing::warn!(
                workcell_id = %id,
                path = %sandbox.path.display(),
                error = %format!("{e:#}"),
                "Sandbox release failed"
            ),
        }
    }
}

/// Run blocking sandbox work without stalling other tasks on this worker.
/// `block_in_place` needs the multi-threaded runtime; elsewhere it runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Turn a panic inside the worker into a failed workcell. Aborts are not
/// panics and pass through untouched.
async fn contain_panics(
    manager: WorkcellManager,
    id: WorkcellId,
    adapter: String,
    work: impl Future<Output = ()>,
) {
    if let Err(payload) = AssertUnwindSafe(work).catch_unwind().await {
        let detail = format!("panicked: {}", panic_message(payload.as_ref()));
        tracing::error!(workcell_id = %id, toolchain = %adapter, %detail, "Workcell task panicked");
        manager.fail_abandoned(&id, FailureReason::AdapterError { adapter, detail });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Worker task: toolchain, then gates. Aborted on eviction.
async fn run_workcell(
    manager: WorkcellManager,
    id: WorkcellId,
    adapter: Arc<dyn ToolchainAdapter>,
    request: InvocationRequest,
    verifier: Verifier,
) {
    let adapter_name = adapter.name().to_string();
    let outcome = tokio::time::timeout(request.timeout + ADAPTER_GRACE, adapter.invoke(&request))
        .await
        .unwrap_or_else(|_| AdapterOutcome::timed_out(0));

    let failure = if outcome.timed_out {
        Some(FailureReason::AdapterTimeout {
            adapter: adapter_name,
            timeout_secs: request.timeout.as_secs(),
        })
    } else if !outcome.success {
        Some(FailureReason::AdapterError {
            adapter: adapter_name,
            detail: outcome
                .error_detail
                .clone()
                .unwrap_or_else(|| "toolchain reported failure".to_string()),
        })
    } else {
        None
    };

    if let Some(reason) = failure {
        manager.transition(&id, WorkcellStatus::Running, "toolchain failed", |w| {
            w.tokens_used = outcome.tokens_used;
            w.status = WorkcellStatus::Failed;
            w.failure = Some(reason);
        });
        return;
    }

    let gating = manager.transition(&id, WorkcellStatus::Running, "toolchain finished", |w| {
        w.tokens_used = outcome.tokens_used;
        w.status = WorkcellStatus::Gating;
    });
    if !gating {
        return;
    }

    let report = verifier.verify(&id, &request.sandbox_path).await;
    let message = match report.verdict {
        Verdict::Pass => "gates passed",
        Verdict::Fail => "gates failed",
    };
    manager.transition(&id, WorkcellStatus::Gating, message, |w| {
        w.status = match report.verdict {
            Verdict::Pass => WorkcellStatus::Completed,
            Verdict::Fail => WorkcellStatus::Failed,
        };
        w.verdict = Some(report.verdict);
        w.failure = report.failure;
        w.gate_results = report.results;
    });
}
