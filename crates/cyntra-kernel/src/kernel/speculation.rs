//! Speculation - competing workcells for one issue and the vote that picks
//! a winner.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::adapters::ToolchainAdapter;
use crate::config::SpeculationConfig;
use crate::error::{KernelError, Result};
use crate::state::{Issue, IssueGraph};
use crate::workcell::{LaunchSpec, Workcell, WorkcellId, WorkcellManager, WorkcellStatus};

/// Absorbs float noise when comparing a pass fraction against the threshold.
const VOTE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Resolved,
    Escalated,
}

/// One issue fanned out into several variants.
#[derive(Debug, Clone, Serialize)]
pub struct SpeculationBatch {
    pub issue_id: String,
    /// In creation order
    pub variants: Vec<WorkcellId>,
    /// Vote weight per variant, parallel to `variants`
    pub weights: Vec<f64>,
    pub state: BatchState,
}

impl SpeculationBatch {
    pub fn new(issue_id: impl Into<String>, variants: Vec<WorkcellId>) -> Self {
        let weights = vec![1.0; variants.len()];
        Self {
            issue_id: issue_id.into(),
            variants,
            weights,
            state: BatchState::Pending,
        }
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        debug_assert_eq!(weights.len(), self.variants.len());
        self.weights = weights;
        self
    }

    fn weight(&self, id: &WorkcellId) -> f64 {
        self.variants
            .iter()
            .position(|v| v == id)
            .and_then(|i| self.weights.get(i).copied())
            .unwrap_or(1.0)
    }
}

/// Outcome of a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Quorum reached.
    Winner {
        winner: WorkcellId,
        /// Passing variants that lost
        discarded: Vec<WorkcellId>,
        failed: Vec<WorkcellId>,
        pass_fraction: f64,
    },
    /// Quorum not reached; no winner.
    Escalated {
        passed: usize,
        total: usize,
        pass_fraction: f64,
    },
    /// A variant was evicted; the vote is void.
    Cancelled,
}

/// Decide a batch whose variants are all terminal.
///
/// The winner is the earliest-finishing passing variant; ties go to the
/// lowest workcell id.
pub fn resolve_votes(batch: &SpeculationBatch, variants: &[Workcell], threshold: f64) -> Resolution {
    if variants.iter().any(|w| w.status == WorkcellStatus::Evicted) {
        return Resolution::Cancelled;
    }

    let total_weight: f64 = variants.iter().map(|w| batch.weight(&w.id)).sum();
    let mut passing: Vec<&Workcell> = variants.iter().filter(|w| w.passed()).collect();
    let pass_weight: f64 = passing.iter().map(|w| batch.weight(&w.id)).sum();
    let pass_fraction = if total_weight > 0.0 {
        pass_weight / total_weight
    } else {
        0.0
    };

    if passing.is_empty() || pass_fraction + VOTE_EPSILON < threshold {
        return Resolution::Escalated {
            passed: passing.len(),
            total: variants.len(),
            pass_fraction,
        };
    }

    passing.sort_by(|a, b| a.finished_at.cmp(&b.finished_at).then(a.id.cmp(&b.id)));
    let winner = passing[0].id.clone();
    Resolution::Winner {
        discarded: passing[1..].iter().map(|w| w.id.clone()).collect(),
        failed: variants
            .iter()
            .filter(|w| !w.passed())
            .map(|w| w.id.clone())
            .collect(),
        winner,
        pass_fraction,
    }
}

/// Whether an issue should be attempted speculatively.
pub fn qualifies(config: &SpeculationConfig, issue: &Issue, graph: &IssueGraph) -> bool {
    if !config.enabled {
        return false;
    }
    issue.speculate
        || config.auto_trigger_risk_levels.contains(&issue.risk)
        || (config.auto_trigger_on_critical_path && graph.has_pending_dependents(&issue.id))
}

/// Tracks batches until they are resolved.
#[derive(Debug, Default)]
pub struct SpeculationEngine {
    batches: BTreeMap<String, SpeculationBatch>,
}

impl SpeculationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild pending batches from uncollected speculative workcells.
    pub fn rebuild(&mut self, workcells: &[Workcell]) {
        let mut grouped: BTreeMap<String, Vec<WorkcellId>> = BTreeMap::new();
        for workcell in workcells.iter().filter(|w| w.speculative && !w.collected) {
            grouped
                .entry(workcell.issue_id.clone())
                .or_default()
                .push(workcell.id.clone());
        }
        for (issue_id, mut variants) in grouped {
            variants.sort();
            tracing::info!(issue_id = %issue_id, variants = variants.len(), "Rebuilt speculation batch");
            self.batches
                .insert(issue_id.clone(), SpeculationBatch::new(issue_id, variants));
        }
    }

    /// Start one variant per adapter. Variants that fail to start are dropped
    /// from the batch; it is an error only if none started.
    pub fn launch(
        &mut self,
        manager: &WorkcellManager,
        issue: &Issue,
        adapters: Vec<Arc<dyn ToolchainAdapter>>,
        tokens_per_variant: u64,
    ) -> Result<SpeculationBatch> {
        let mut variants = Vec::new();
        let mut first_error = None;

        for adapter in adapters {
            let spec = LaunchSpec {
                issue: issue.clone(),
                adapter,
                reserved_tokens: tokens_per_variant,
                speculative: true,
            };
            match manager.create(spec) {
                Ok(id) => variants.push(id),
                Err(e) => {
                    tracing::warn!(issue_id = %issue.id, error = %e, "Speculative variant failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        if variants.is_empty() {
            return Err(first_error.unwrap_or_else(|| KernelError::NoAdapterAvailable(issue.id.clone())));
        }

        tracing::info!(issue_id = %issue.id, variants = variants.len(), "Speculation launched");
        let batch = SpeculationBatch::new(issue.id.clone(), variants);
        self.batches.insert(issue.id.clone(), batch.clone());
        Ok(batch)
    }

    pub fn get(&self, issue_id: &str) -> Option<&SpeculationBatch> {
        self.batches.get(issue_id)
    }

    pub fn batches(&self) -> impl Iterator<Item = &SpeculationBatch> {
        self.batches.values()
    }

    pub fn is_speculating(&self, issue_id: &str) -> bool {
        self.batches.contains_key(issue_id)
    }

    /// Pending batches whose variants have all reached a terminal state.
    pub fn ready_to_resolve(&self, manager: &WorkcellManager) -> Vec<(SpeculationBatch, Vec<Workcell>)> {
        self.batches
            .values()
            .filter(|b| b.state == BatchState::Pending)
            .filter_map(|batch| {
                let variants: Vec<Workcell> =
                    batch.variants.iter().filter_map(|id| manager.get(id)).collect();
                let done = !variants.is_empty() && variants.iter().all(|w| w.status.is_terminal());
                done.then(|| (batch.clone(), variants))
            })
            .collect()
    }

    /// Drop a batch once its outcome has been applied.
    pub fn finish(&mut self, issue_id: &str, state: BatchState) {
        if let Some(mut batch) = self.batches.remove(issue_id) {
            batch.state = state;
            tracing::info!(issue_id, state = ?batch.state, "Speculation batch closed");
        }
    }
}
