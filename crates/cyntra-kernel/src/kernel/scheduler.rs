//! Scheduler - computes the ready set, applies starvation boosts and asks
//! admission control what to start.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::admission::{Admission, AdmissionController, AdmissionLimits, Candidate, SkipReason, Usage};
use super::speculation;
use crate::config::KernelConfig;
use crate::state::{Issue, IssueGraph};

/// Result of a scheduling cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScheduleResult {
    /// Issues ready to be worked on
    pub ready_issues: Vec<String>,
    /// Ready issues that received a starvation boost
    pub boosted: Vec<String>,
    /// Admitted this cycle, in ranked order
    pub admitted: Vec<Admission>,
    pub skipped: Vec<(String, SkipReason)>,
    pub inadmissible: Vec<String>,
    /// Wanted speculation, admitted as a single workcell
    pub downgraded: Vec<String>,
    /// Total estimated tokens reserved
    pub total_tokens: u64,
}

impl ScheduleResult {
    pub fn speculative(&self) -> impl Iterator<Item = &Admission> {
        self.admitted.iter().filter(|a| a.speculative())
    }

    pub fn summary(&self) -> String {
        format!(
            "Ready: {}, Scheduled: {}, Speculate: {}, Boosted: {}, Tokens: {}",
            self.ready_issues.len(),
            self.admitted.len(),
            self.speculative().count(),
            self.boosted.len(),
            self.total_tokens
        )
    }
}

/// Scheduler for selecting and prioritizing work.
pub struct Scheduler<'a> {
    config: &'a KernelConfig,
    target: Option<&'a str>,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a KernelConfig) -> Self {
        Self {
            config,
            target: None,
        }
    }

    /// Only consider this issue.
    pub fn with_target(mut self, target: Option<&'a str>) -> Self {
        self.target = target;
        self
    }

    fn starvation_threshold(&self) -> Duration {
        let hours = self.config.scheduling.starvation_threshold_hours;
        Duration::milliseconds((hours * 3_600_000.0) as i64)
    }

    /// Ready longer than the threshold without ever having been admitted.
    pub fn is_starved(&self, issue: &Issue, now: DateTime<Utc>) -> bool {
        !issue.ever_admitted()
            && issue
                .ready_since
                .is_some_and(|since| now - since > self.starvation_threshold())
    }

    /// Run a scheduling cycle
    ///
    /// `busy` holds issues that already have an active or uncollected
    /// workcell; they are never admitted again.
    pub fn schedule(
        &self,
        graph: &IssueGraph,
        usage: Usage,
        busy: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> ScheduleResult {
        let mut result = ScheduleResult::default();

        let ready: Vec<&Issue> = graph
            .ready_issues()
            .into_iter()
            .filter(|i| !busy.contains(&i.id))
            .filter(|i| self.target.map_or(true, |t| t == i.id))
            .collect();

        let candidates: Vec<Candidate> = ready
            .iter()
            .map(|issue| {
                let boosted = self.is_starved(issue, now);
                if boosted {
                    result.boosted.push(issue.id.clone());
                }
                let variants = if speculation::qualifies(&self.config.speculation, issue, graph) {
                    self.config.speculation.default_parallelism
                } else {
                    1
                };
                Candidate {
                    issue_id: issue.id.clone(),
                    priority: issue.priority,
                    boosted,
                    ready_since: issue.ready_since,
                    estimated_tokens: issue
                        .estimated_tokens_or(self.config.scheduling.default_estimated_tokens),
                    variants,
                }
            })
            .collect();
        result.ready_issues = ready.iter().map(|i| i.id.clone()).collect();

        let controller = AdmissionController::new(AdmissionLimits::from(&self.config.scheduling));
        let plan = controller.admit(candidates, usage);

        result.total_tokens = plan.reserved_tokens();
        result.admitted = plan.admitted;
        result.skipped = plan.skipped;
        result.inadmissible = plan.inadmissible;
        result.downgraded = plan.downgraded;
        result
    }
}
