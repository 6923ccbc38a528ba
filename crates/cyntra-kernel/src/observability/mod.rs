//! Observability - event log and status snapshots.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{IssueGraph, IssueStatus};
use crate::workcell::{Workcell, WorkcellId, WorkcellStatus};

/// A kernel event for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub issue_id: Option<String>,
    pub workcell_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl KernelEvent {
    pub fn new(event_type: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            issue_id: None,
            workcell_id: None,
            from: None,
            to: None,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn issue(mut self, issue_id: &str) -> Self {
        self.issue_id = Some(issue_id.to_string());
        self
    }

    pub fn workcell(mut self, workcell_id: &WorkcellId) -> Self {
        self.workcell_id = Some(workcell_id.to_string());
        self
    }

    pub fn transition(mut self, from: Option<&str>, to: &str) -> Self {
        self.from = from.map(str::to_string);
        self.to = Some(to.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Appends kernel events to `events.jsonl`.
pub struct EventEmitter {
    events_path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventEmitter {
    pub fn new(events_path: &Path) -> Self {
        Self {
            events_path: events_path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Emit an event.
    pub fn emit(&self, event: KernelEvent) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Emit, logging instead of failing. Audit writes never stop the kernel.
    pub fn record(&self, event: KernelEvent) {
        if let Err(e) = self.emit(event) {
            tracing::warn!(
                path = %self.events_path.display(),
                error = %e,
                "Failed to append kernel event"
            );
        }
    }

    /// Issue status change.
    pub fn issue_transition(&self, issue_id: &str, from: IssueStatus, to: IssueStatus, why: &str) {
        tracing::info!(issue_id, %from, %to, "Issue transition");
        self.record(
            KernelEvent::new("issue.transition", why)
                .issue(issue_id)
                .transition(Some(from.as_str()), to.as_str()),
        );
    }

    /// Workcell status change.
    pub fn workcell_transition(
        &self,
        workcell: &Workcell,
        from: Option<WorkcellStatus>,
        message: &str,
    ) {
        tracing::info!(
            issue_id = %workcell.issue_id,
            workcell_id = %workcell.id,
            from = from.map(|s| s.as_str()).unwrap_or("-"),
            to = %workcell.status,
            "Workcell transition"
        );
        self.record(
            KernelEvent::new("workcell.transition", message)
                .issue(&workcell.issue_id)
                .workcell(&workcell.id)
                .transition(from.map(|s| s.as_str()), workcell.status.as_str())
                .metadata(serde_json::json!({
                    "toolchain": workcell.toolchain,
                    "tokens_used": workcell.tokens_used,
                    "failure": workcell.failure,
                })),
        );
    }

    /// Read recent events.
    pub fn read_recent(&self, limit: usize) -> Vec<KernelEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<KernelEvent> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        // Return last N events
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }
}

/// Per-workcell line of the status query.
#[derive(Debug, Clone, Serialize)]
pub struct WorkcellStatusEntry {
    pub workcell_id: String,
    pub issue_id: String,
    pub status: WorkcellStatus,
    pub toolchain: String,
    pub elapsed_secs: u64,
    pub tokens_used: u64,
    pub reserved_tokens: u64,
    pub speculative: bool,
}

impl From<&Workcell> for WorkcellStatusEntry {
    fn from(w: &Workcell) -> Self {
        Self {
            workcell_id: w.id.to_string(),
            issue_id: w.issue_id.clone(),
            status: w.status,
            toolchain: w.toolchain.clone(),
            elapsed_secs: w.elapsed().as_secs(),
            tokens_used: w.tokens_used,
            reserved_tokens: w.reserved_tokens,
            speculative: w.speculative,
        }
    }
}

/// Kernel status snapshot.
#[derive(Debug, Serialize)]
pub struct KernelStatus {
    pub issue_counts: BTreeMap<String, usize>,
    pub ready_issues: Vec<String>,
    pub critical_path: Vec<String>,
    pub active_workcells: Vec<WorkcellStatusEntry>,
    pub active_tokens: u64,
    pub recent_events: Vec<KernelEvent>,
}

impl KernelStatus {
    pub fn build(graph: &IssueGraph, workcells: &[Workcell], recent_events: Vec<KernelEvent>) -> Self {
        let active: Vec<&Workcell> = workcells.iter().filter(|w| w.is_active()).collect();
        Self {
            issue_counts: graph
                .status_counts()
                .into_iter()
                .map(|(status, n)| (status.to_string(), n))
                .collect(),
            ready_issues: graph.ready_issues().iter().map(|i| i.id.clone()).collect(),
            critical_path: graph.critical_path().iter().map(|i| i.id.clone()).collect(),
            active_tokens: active.iter().map(|w| w.charged_tokens()).sum(),
            active_workcells: active.into_iter().map(WorkcellStatusEntry::from).collect(),
            recent_events,
        }
    }
}
