//! Kernel error taxonomy.

use thiserror::Error;

/// Errors surfaced by the kernel.
///
/// Only [`KernelError::ConfigInvalid`] is fatal, and only at startup. Every
/// other variant is contained to a single cycle, admission attempt, or
/// workcell.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("issue tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("sandbox acquisition failed for issue {issue_id}: {detail}")]
    SandboxAcquisitionFailed { issue_id: String, detail: String },

    #[error("toolchain {adapter} timed out after {timeout_secs}s")]
    AdapterTimeout { adapter: String, timeout_secs: u64 },

    #[error("toolchain {adapter} failed: {detail}")]
    AdapterError { adapter: String, detail: String },

    #[error("quality gate {gate} timed out after {timeout_secs}s")]
    GateTimeout { gate: String, timeout_secs: u64 },

    #[error("quality gate {gate} failed (exit status {exit_code:?})")]
    GateFailed { gate: String, exit_code: Option<i32> },

    #[error("speculation for issue {issue_id} escalated: {passed}/{total} variants passed")]
    SpeculationEscalated {
        issue_id: String,
        passed: usize,
        total: usize,
    },

    #[error("no toolchain adapter available for issue {0}")]
    NoAdapterAvailable(String),

    #[error("workcell state persistence failed: {0}")]
    Persistence(String),
}

impl KernelError {
    /// Wrap a tracker backend error.
    pub fn tracker(err: anyhow::Error) -> Self {
        Self::TrackerUnavailable(format!("{err:#}"))
    }

    /// Whether this error stops the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_))
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
