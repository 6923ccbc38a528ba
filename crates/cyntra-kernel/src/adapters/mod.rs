//! Adapters - toolchain integrations for code-change agents.

mod claude;
mod codex;
mod command;
mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::KernelConfig;
use crate::workcell::WorkcellId;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use command::CommandAdapter;
pub use process::{find_executable, parse_tokens_used};

pub(crate) use process::tail as output_tail;

/// Everything a toolchain needs to attempt an issue.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub workcell_id: WorkcellId,
    pub issue_id: String,
    pub sandbox_path: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    /// Where stdout/stderr are captured (outside the sandbox)
    pub log_dir: PathBuf,
}

/// What a toolchain reported back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOutcome {
    pub success: bool,
    pub tokens_used: u64,
    pub error_detail: Option<String>,
    pub timed_out: bool,
}

impl AdapterOutcome {
    pub fn succeeded(tokens_used: u64) -> Self {
        Self {
            success: true,
            tokens_used,
            ..Self::default()
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn timed_out(tokens_used: u64) -> Self {
        Self {
            tokens_used,
            timed_out: true,
            error_detail: Some("timed out".to_string()),
            ..Self::default()
        }
    }
}

/// A toolchain that can be invoked against a sandbox.
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Health check (binary present, credentials, ...).
    async fn is_available(&self) -> bool;

    /// Hard bound on a single invocation.
    fn timeout(&self) -> Duration;

    async fn invoke(&self, request: &InvocationRequest) -> AdapterOutcome;
}

/// Configured adapters in priority order.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn ToolchainAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn ToolchainAdapter>>) -> Self {
        Self { adapters }
    }

    /// Build adapters for `toolchain_priority`, skipping disabled entries.
    pub fn from_config(config: &KernelConfig) -> Self {
        let mut adapters: Vec<Arc<dyn ToolchainAdapter>> = Vec::new();
        for name in &config.toolchain_priority {
            let toolchain = config.toolchain(name);
            if !toolchain.enabled {
                continue;
            }
            match name.as_str() {
                "claude" => adapters.push(Arc::new(ClaudeAdapter::new(toolchain))),
                "codex" => adapters.push(Arc::new(CodexAdapter::new(toolchain))),
                other if toolchain.command.is_some() => {
                    adapters.push(Arc::new(CommandAdapter::new(other, toolchain)))
                }
                other => tracing::warn!(toolchain = other, "Unknown toolchain without a command"),
            }
        }
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolchainAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapters passing their health check, in priority order.
    pub async fn available(&self) -> Vec<Arc<dyn ToolchainAdapter>> {
        let checks = futures::future::join_all(self.adapters.iter().map(|a| a.is_available())).await;
        self.adapters
            .iter()
            .zip(checks)
            .filter_map(|(adapter, ok)| {
                if !ok {
                    tracing::debug!(toolchain = adapter.name(), "Toolchain unavailable");
                }
                ok.then(|| Arc::clone(adapter))
            })
            .collect()
    }
}
