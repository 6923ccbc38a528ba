//! Workcell management - isolated sandboxes, their lifecycle and records.

mod manager;
mod sandbox;
mod store;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::kernel::{QualityGateResult, Verdict};

pub use manager::{LaunchSpec, Recovery, WorkcellManager};
pub use sandbox::{GitWorktrees, Sandbox, WorktreeProvider};
pub use store::WorkcellStore;

/// Workcell identifier, `wc-<issue>-<seq>`.
///
/// The sequence is zero-padded, so ordering by id within an issue is
/// creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkcellId(String);

impl WorkcellId {
    pub fn new(issue_id: &str, seq: u64) -> Self {
        Self(format!("wc-{}-{:06}", issue_id, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkcellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkcellStatus {
    Created,
    Running,
    Gating,
    Completed,
    Failed,
    Evicted,
}

impl WorkcellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Gating => "gating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
        }
    }

    /// Counts against the admission ceilings.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Running | Self::Gating)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for WorkcellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a workcell ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    AdapterTimeout { adapter: String, timeout_secs: u64 },
    AdapterError { adapter: String, detail: String },
    GateTimeout { gate: String, timeout_secs: u64 },
    GateFailed { gate: String, exit_code: Option<i32> },
    /// The kernel stopped while the workcell was in flight.
    Interrupted,
}

impl FailureReason {
    /// Failures that consume the retry budget instead of producing a fix issue.
    pub fn is_adapter_level(&self) -> bool {
        matches!(
            self,
            Self::AdapterTimeout { .. } | Self::AdapterError { .. } | Self::Interrupted
        )
    }

    pub fn to_error(&self, toolchain: &str) -> KernelError {
        match self.clone() {
            Self::AdapterTimeout {
                adapter,
                timeout_secs,
            } => KernelError::AdapterTimeout {
                adapter,
                timeout_secs,
            },
            Self::AdapterError { adapter, detail } => KernelError::AdapterError { adapter, detail },
            Self::GateTimeout { gate, timeout_secs } => {
                KernelError::GateTimeout { gate, timeout_secs }
            }
            Self::GateFailed { gate, exit_code } => KernelError::GateFailed { gate, exit_code },
            Self::Interrupted => KernelError::AdapterError {
                adapter: toolchain.to_string(),
                detail: "interrupted by kernel restart".to_string(),
            },
        }
    }
}

/// Persisted record of one workcell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workcell {
    pub id: WorkcellId,
    pub seq: u64,
    pub issue_id: String,
    pub sandbox: Sandbox,
    pub toolchain: String,
    pub status: WorkcellStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Estimate reserved at admission
    pub reserved_tokens: u64,
    /// Usage reported by the toolchain
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub gate_results: Vec<QualityGateResult>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Member of a speculation batch
    #[serde(default)]
    pub speculative: bool,
    #[serde(default)]
    pub sandbox_released: bool,
    /// Verdict applied to the issue tracker
    #[serde(default)]
    pub collected: bool,
    #[serde(default)]
    pub merge_ready: bool,
    /// Passing speculative variant that lost the vote
    #[serde(default)]
    pub discarded: bool,
}

impl Workcell {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn passed(&self) -> bool {
        self.status == WorkcellStatus::Completed && self.verdict == Some(Verdict::Pass)
    }

    /// Tokens counted against the ceiling.
    pub fn charged_tokens(&self) -> u64 {
        self.reserved_tokens.max(self.tokens_used)
    }

    pub fn elapsed(&self) -> Duration {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or_default()
    }

    /// The failure as a kernel error, for reporting.
    pub fn error(&self) -> Option<KernelError> {
        self.failure.as_ref().map(|f| f.to_error(&self.toolchain))
    }
}
