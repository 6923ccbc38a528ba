//! Issue tracker - the external owner of issues and blocking edges.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::issue::{Issue, IssueStatus};

/// Operations the kernel needs from the issue tracker.
///
/// Implementations must make `transition` an atomic compare-and-set: it is
/// the only thing preventing two cycles from admitting the same issue.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Fetch every issue with its blocking edges.
    async fn list_issues(&self) -> Result<Vec<Issue>>;

    /// Move `id` from `expected` to `next`. Returns false if the issue was
    /// not in `expected`.
    async fn transition(&self, id: &str, expected: IssueStatus, next: IssueStatus)
        -> Result<bool>;

    async fn mark_done(&self, id: &str) -> Result<()>;

    /// Park the issue as `blocked_failed`.
    async fn mark_failed(&self, id: &str) -> Result<()>;

    /// Return the issue to `open`; readiness is recomputed next cycle.
    async fn reopen(&self, id: &str) -> Result<()>;

    /// Count a failed attempt, returning the new total. While the total
    /// stays under `budget` the issue is reopened in the same write.
    async fn record_attempt(&self, id: &str, budget: u32) -> Result<u32>;

    /// Create a fix issue that blocks `for_issue`.
    async fn create_fix_issue(&self, for_issue: &str, description: &str) -> Result<Issue>;
}

/// Apply a status change and maintain `ready_since` and `admitted_at`.
fn set_status(issue: &mut Issue, status: IssueStatus) {
    match status {
        IssueStatus::Ready => {
            if issue.ready_since.is_none() {
                issue.ready_since = Some(Utc::now());
            }
        }
        IssueStatus::Open | IssueStatus::Done | IssueStatus::BlockedFailed => {
            issue.ready_since = None;
        }
        IssueStatus::InProgress => {
            if issue.admitted_at.is_none() {
                issue.admitted_at = Some(Utc::now());
            }
        }
        IssueStatus::Gating => {}
    }
    issue.status = status;
    issue.updated_at = Some(Utc::now());
}

fn build_fix_issue(original: &Issue, description: &str) -> Issue {
    let suffix = Uuid::new_v4().simple().to_string();
    let mut fix = Issue::new(
        format!("{}-fix-{}", original.id, &suffix[..8]),
        format!("[FIX] {}", original.title),
    );
    fix.body = description.to_string();
    fix.priority = original.priority;
    fix.risk = original.risk;
    fix.labels = original.labels.clone();
    if !fix.labels.iter().any(|l| l == "fix") {
        fix.labels.push("fix".to_string());
    }
    fix.parent = Some(original.id.clone());
    fix
}

/// In-place edits shared by the tracker backends.
struct IssueTable {
    issues: BTreeMap<String, Issue>,
    /// Edges that only exist in the tracker's dependency file. Never saved
    /// back into the issues file.
    external_edges: BTreeMap<String, BTreeSet<String>>,
}

impl IssueTable {
    fn new(issues: impl IntoIterator<Item = Issue>) -> Self {
        Self {
            issues: issues.into_iter().map(|i| (i.id.clone(), i)).collect(),
            external_edges: BTreeMap::new(),
        }
    }

    /// Issues as the kernel owns them, without dependency-file edges.
    fn owned_issues(&self) -> impl Iterator<Item = Issue> + '_ {
        self.issues.values().map(|issue| {
            let mut issue = issue.clone();
            if let Some(edges) = self.external_edges.get(&issue.id) {
                issue.depends_on.retain(|blocker| !edges.contains(blocker));
            }
            issue
        })
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Issue> {
        self.issues
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown issue {id}"))
    }

    fn transition(&mut self, id: &str, expected: IssueStatus, next: IssueStatus) -> Result<bool> {
        let issue = self.get_mut(id)?;
        if issue.status != expected {
            return Ok(false);
        }
        set_status(issue, next);
        Ok(true)
    }

    fn set(&mut self, id: &str, status: IssueStatus) -> Result<()> {
        set_status(self.get_mut(id)?, status);
        Ok(())
    }

    fn record_attempt(&mut self, id: &str, budget: u32) -> Result<u32> {
        let issue = self.get_mut(id)?;
        issue.attempts += 1;
        if issue.attempts < budget {
            set_status(issue, IssueStatus::Open);
        }
        Ok(issue.attempts)
    }

    fn create_fix_issue(&mut self, for_issue: &str, description: &str) -> Result<Issue> {
        let original = self
            .issues
            .get(for_issue)
            .ok_or_else(|| anyhow!("unknown issue {for_issue}"))?;
        let fix = build_fix_issue(original, description);
        self.get_mut(for_issue)?.depends_on.insert(fix.id.clone());
        self.issues.insert(fix.id.clone(), fix.clone());
        Ok(fix)
    }
}

/// In-memory tracker, for embedding and tests.
pub struct MemoryTracker {
    table: Mutex<IssueTable>,
    unavailable: AtomicBool,
}

impl MemoryTracker {
    pub fn new(issues: impl IntoIterator<Item = Issue>) -> Self {
        Self {
            table: Mutex::new(IssueTable::new(issues)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current copy of an issue.
    pub fn issue(&self, id: &str) -> Option<Issue> {
        self.table.lock().ok()?.issues.get(id).cloned()
    }

    /// Insert or replace an issue, as another actor would.
    pub fn upsert(&self, issue: Issue) {
        if let Ok(mut table) = self.table.lock() {
            table.issues.insert(issue.id.clone(), issue);
        }
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut IssueTable) -> Result<T>) -> Result<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("tracker unreachable");
        }
        let mut table = self
            .table
            .lock()
            .map_err(|_| anyhow!("tracker state poisoned"))?;
        f(&mut table)
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    async fn list_issues(&self) -> Result<Vec<Issue>> {
        self.with_table(|t| Ok(t.issues.values().cloned().collect()))
    }

    async fn transition(
        &self,
        id: &str,
        expected: IssueStatus,
        next: IssueStatus,
    ) -> Result<bool> {
        self.with_table(|t| t.transition(id, expected, next))
    }

    async fn mark_done(&self, id: &str) -> Result<()> {
        self.with_table(|t| t.set(id, IssueStatus::Done))
    }

    async fn mark_failed(&self, id: &str) -> Result<()> {
        self.with_table(|t| t.set(id, IssueStatus::BlockedFailed))
    }

    async fn reopen(&self, id: &str) -> Result<()> {
        self.with_table(|t| t.set(id, IssueStatus::Open))
    }

    async fn record_attempt(&self, id: &str, budget: u32) -> Result<u32> {
        self.with_table(|t| t.record_attempt(id, budget))
    }

    async fn create_fix_issue(&self, for_issue: &str, description: &str) -> Result<Issue> {
        self.with_table(|t| t.create_fix_issue(for_issue, description))
    }
}

/// File-backed tracker over `.beads/issues.jsonl` (+ optional `deps.jsonl`).
///
/// Every mutation is a read-modify-write of the whole file, serialized by an
/// in-process lock and committed with an atomic rename.
pub struct BeadsTracker {
    beads_dir: PathBuf,
    lock: Mutex<()>,
}

#[derive(Debug, serde::Deserialize)]
struct Dependency {
    issue_id: String,
    depends_on: String,
}

impl BeadsTracker {
    pub fn new(beads_dir: impl Into<PathBuf>) -> Self {
        Self {
            beads_dir: beads_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn issues_path(&self) -> PathBuf {
        self.beads_dir.join("issues.jsonl")
    }

    fn deps_path(&self) -> PathBuf {
        self.beads_dir.join("deps.jsonl")
    }

    /// Load the graph from disk
    fn load(&self) -> Result<IssueTable> {
        let issues_path = self.issues_path();
        let mut issues = Vec::new();

        if issues_path.exists() {
            let content = std::fs::read_to_string(&issues_path)
                .with_context(|| format!("Failed to read {}", issues_path.display()))?;

            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let issue: Issue = serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse issue: {}", line))?;
                issues.push(issue);
            }
        }
        let mut table = IssueTable::new(issues);

        // Load dependencies (optional file)
        let deps_path = self.deps_path();
        if deps_path.exists() {
            let content = std::fs::read_to_string(&deps_path)
                .with_context(|| format!("Failed to read {}", deps_path.display()))?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Dependency>(line) {
                    Ok(dep) => {
                        if let Some(issue) = table.issues.get_mut(&dep.issue_id) {
                            if issue.depends_on.insert(dep.depends_on.clone()) {
                                table
                                    .external_edges
                                    .entry(dep.issue_id)
                                    .or_default()
                                    .insert(dep.depends_on);
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, line, "Skipping malformed dependency"),
                }
            }
        }

        Ok(table)
    }

    fn save(&self, table: &IssueTable) -> Result<()> {
        std::fs::create_dir_all(&self.beads_dir)
            .with_context(|| format!("Failed to create {}", self.beads_dir.display()))?;

        let mut out = String::new();
        for issue in table.owned_issues() {
            out.push_str(&serde_json::to_string(&issue)?);
            out.push('\n');
        }
        write_atomic(&self.issues_path(), out.as_bytes())
    }

    fn read<T>(&self, f: impl FnOnce(&IssueTable) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("tracker lock poisoned"))?;
        f(&self.load()?)
    }

    fn update<T>(&self, f: impl FnOnce(&mut IssueTable) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("tracker lock poisoned"))?;
        let mut table = self.load()?;
        let out = f(&mut table)?;
        self.save(&table)?;
        Ok(out)
    }
}

#[async_trait]
impl IssueTracker for BeadsTracker {
    async fn list_issues(&self) -> Result<Vec<Issue>> {
        self.read(|t| Ok(t.issues.values().cloned().collect()))
    }

    async fn transition(
        &self,
        id: &str,
        expected: IssueStatus,
        next: IssueStatus,
    ) -> Result<bool> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("tracker lock poisoned"))?;
        let mut table = self.load()?;
        if !table.transition(id, expected, next)? {
            return Ok(false);
        }
        self.save(&table)?;
        Ok(true)
    }

    async fn mark_done(&self, id: &str) -> Result<()> {
        self.update(|t| t.set(id, IssueStatus::Done))
    }

    async fn mark_failed(&self, id: &str) -> Result<()> {
        self.update(|t| t.set(id, IssueStatus::BlockedFailed))
    }

    async fn reopen(&self, id: &str) -> Result<()> {
        self.update(|t| t.set(id, IssueStatus::Open))
    }

    async fn record_attempt(&self, id: &str, budget: u32) -> Result<u32> {
        self.update(|t| t.record_attempt(id, budget))
    }

    async fn create_fix_issue(&self, for_issue: &str, description: &str) -> Result<Issue> {
        self.update(|t| t.create_fix_issue(for_issue, description))
    }
}

/// Write via a sibling temp file and rename over the target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
