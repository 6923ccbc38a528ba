//! Dispatcher - routes issues to toolchain adapters.

use std::sync::Arc;

use crate::adapters::{AdapterRegistry, ToolchainAdapter};
use crate::state::Issue;

/// Picks adapters by priority among those that passed the last health check.
pub struct Dispatcher {
    registry: AdapterRegistry,
    available: Vec<Arc<dyn ToolchainAdapter>>,
}

impl Dispatcher {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self {
            registry,
            available: Vec::new(),
        }
    }

    /// Swap in adapters built from new toolchain settings.
    pub fn set_registry(&mut self, registry: AdapterRegistry) {
        self.registry = registry;
        self.available.clear();
    }

    /// Re-run adapter health checks. Called once per cycle.
    pub async fn refresh(&mut self) {
        self.available = self.registry.available().await;
    }

    pub fn available_names(&self) -> Vec<&str> {
        self.available.iter().map(|a| a.name()).collect()
    }

    /// Index to start from: the issue's hint if available, else the first.
    fn start_index(&self, issue: &Issue) -> usize {
        issue
            .tool_hint
            .as_deref()
            .and_then(|hint| self.available.iter().position(|a| a.name() == hint))
            .unwrap_or(0)
    }

    /// Select the toolchain for an issue
    pub fn select(&self, issue: &Issue) -> Option<Arc<dyn ToolchainAdapter>> {
        self.select_variants(issue, 1).into_iter().next()
    }

    /// `n` adapters for speculation, rotating over the available ones so
    /// variants use different toolchains where possible.
    pub fn select_variants(&self, issue: &Issue, n: usize) -> Vec<Arc<dyn ToolchainAdapter>> {
        if self.available.is_empty() {
            return Vec::new();
        }
        let start = self.start_index(issue);
        (0..n)
            .map(|i| Arc::clone(&self.available[(start + i) % self.available.len()]))
            .collect()
    }
}
