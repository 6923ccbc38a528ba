#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use cyntra_kernel::adapters::{AdapterOutcome, AdapterRegistry, InvocationRequest, ToolchainAdapter};
use cyntra_kernel::kernel::{KernelRunner, Verdict};
use cyntra_kernel::observability::EventEmitter;
use cyntra_kernel::state::{Issue, MemoryTracker};
use cyntra_kernel::workcell::{
    Sandbox, Workcell, WorkcellId, WorkcellManager, WorkcellStatus, WorkcellStore, WorktreeProvider,
};
use cyntra_kernel::KernelConfig;

/// One scripted toolchain run.
#[derive(Debug, Clone)]
pub struct Step {
    pub success: bool,
    pub tokens: u64,
    pub delay: Duration,
    /// File created in the sandbox before returning
    pub writes: Option<&'static str>,
    pub panics: bool,
}

impl Step {
    pub fn ok() -> Self {
        Self {
            success: true,
            tokens: 1_000,
            delay: Duration::ZERO,
            writes: None,
            panics: false,
        }
    }

    /// A toolchain that blows up mid-run.
    pub fn panic() -> Self {
        Self {
            panics: true,
            ..Self::ok()
        }
    }

    pub fn fail() -> Self {
        Self {
            success: false,
            ..Self::ok()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn writes(mut self, file: &'static str) -> Self {
        self.writes = Some(file);
        self
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Adapter that replays scripted steps (then repeats the default step).
pub struct ScriptedAdapter {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    default: Step,
    timeout: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &str, default: Step) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(VecDeque::new()),
            default,
            timeout: Duration::from_secs(30),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolchainAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(&self, request: &InvocationRequest) -> AdapterOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if tokio::time::timeout(request.timeout, tokio::time::sleep(step.delay))
            .await
            .is_err()
        {
            return AdapterOutcome::timed_out(0);
        }
        if step.panics {
            panic!("scripted adapter crashed");
        }
        if let Some(file) = step.writes {
            std::fs::write(request.sandbox_path.join(file), "ok").unwrap();
        }
        if step.success {
            AdapterOutcome::succeeded(step.tokens)
        } else {
            AdapterOutcome {
                tokens_used: step.tokens,
                ..AdapterOutcome::failed("scripted failure")
            }
        }
    }
}

/// Plain directories standing in for worktrees; records every release.
pub struct DirSandboxes {
    root: PathBuf,
    releases: Mutex<Vec<(String, bool)>>,
    fail_acquire: AtomicBool,
}

impl DirSandboxes {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            releases: Mutex::new(Vec::new()),
            fail_acquire: AtomicBool::new(false),
        }
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn release_count(&self, name: &str) -> usize {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    pub fn releases(&self) -> Vec<(String, bool)> {
        self.releases.lock().unwrap().clone()
    }
}

impl WorktreeProvider for DirSandboxes {
    fn acquire(&self, issue_id: &str, workcell_id: &WorkcellId) -> anyhow::Result<Sandbox> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            anyhow::bail!("no space left for worktree");
        }
        let path = self.root.join(workcell_id.as_str());
        std::fs::create_dir_all(&path)?;
        Ok(Sandbox {
            name: workcell_id.to_string(),
            path,
            branch: format!("wc/{}/{}", issue_id, workcell_id),
        })
    }

    fn release(&self, sandbox: &Sandbox, keep_branch: bool) -> anyhow::Result<()> {
        self.releases
            .lock()
            .unwrap()
            .push((sandbox.name.clone(), keep_branch));
        if sandbox.path.exists() {
            std::fs::remove_dir_all(&sandbox.path)?;
        }
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: KernelConfig,
    pub tracker: Arc<MemoryTracker>,
    pub sandboxes: Arc<DirSandboxes>,
    pub events: Arc<EventEmitter>,
    pub manager: WorkcellManager,
}

impl Harness {
    pub fn new(config: KernelConfig, issues: Vec<Issue>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.resolve_paths(dir.path());

        let tracker = Arc::new(MemoryTracker::new(issues));
        let sandboxes = Arc::new(DirSandboxes::new(&config.workcells_dir));
        let events = Arc::new(EventEmitter::new(&config.events_path));
        let manager = Self::build_manager(&config, &sandboxes, &events);

        Self {
            dir,
            config,
            tracker,
            sandboxes,
            events,
            manager,
        }
    }

    fn build_manager(
        config: &KernelConfig,
        sandboxes: &Arc<DirSandboxes>,
        events: &Arc<EventEmitter>,
    ) -> WorkcellManager {
        WorkcellManager::new(
            WorkcellStore::new(&config.state_dir),
            sandboxes.clone(),
            events.clone(),
            config.gates.clone(),
            &config.logs_dir,
        )
    }

    /// A manager over the same state directory, as after a restart.
    pub fn restarted_manager(&self) -> WorkcellManager {
        Self::build_manager(&self.config, &self.sandboxes, &self.events)
    }

    pub fn runner(&self, adapters: Vec<Arc<dyn ToolchainAdapter>>) -> KernelRunner {
        KernelRunner::new(
            self.config.clone(),
            self.tracker.clone(),
            self.manager.clone(),
            AdapterRegistry::new(adapters),
            self.events.clone(),
        )
    }

    pub fn store(&self) -> WorkcellStore {
        WorkcellStore::new(&self.config.state_dir)
    }

    pub fn issue(&self, id: &str) -> Issue {
        self.tracker.issue(id).unwrap()
    }

    pub fn events_path(&self) -> &Path {
        &self.config.events_path
    }
}

pub fn adapter(step: Step) -> Arc<dyn ToolchainAdapter> {
    Arc::new(ScriptedAdapter::new("scripted", step))
}

/// Terminal workcell record for vote tests.
pub fn variant(seq: u64, passed: bool, finished_at: DateTime<Utc>) -> Workcell {
    let id = WorkcellId::new("7", seq);
    Workcell {
        sandbox: Sandbox {
            name: id.to_string(),
            path: PathBuf::from("/tmp").join(id.as_str()),
            branch: format!("wc/7/{}", id),
        },
        id,
        seq,
        issue_id: "7".to_string(),
        toolchain: "scripted".to_string(),
        status: if passed {
            WorkcellStatus::Completed
        } else {
            WorkcellStatus::Failed
        },
        created_at: finished_at - chrono::Duration::minutes(5),
        started_at: None,
        finished_at: Some(finished_at),
        reserved_tokens: 1_000,
        tokens_used: 0,
        gate_results: Vec::new(),
        verdict: Some(if passed { Verdict::Pass } else { Verdict::Fail }),
        failure: None,
        speculative: true,
        sandbox_released: false,
        collected: false,
        merge_ready: false,
        discarded: false,
    }
}
