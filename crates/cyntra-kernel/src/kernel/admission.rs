//! Admission control - greedy packing of ranked ready issues under the
//! workcell and token ceilings.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SchedulingConfig;
use crate::state::Priority;

/// Resources held by active workcells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub active_workcells: usize,
    pub active_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_workcells: usize,
    pub max_tokens: u64,
}

impl From<&SchedulingConfig> for AdmissionLimits {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            max_workcells: config.max_concurrent_workcells,
            max_tokens: config.max_concurrent_tokens,
        }
    }
}

/// A ready issue asking to be admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub issue_id: String,
    pub priority: Priority,
    /// Starvation boost applies
    pub boosted: bool,
    pub ready_since: Option<DateTime<Utc>>,
    pub estimated_tokens: u64,
    /// Workcells wanted; more than one asks for speculation
    pub variants: usize,
}

impl Candidate {
    pub fn new(issue_id: impl Into<String>, priority: Priority, estimated_tokens: u64) -> Self {
        Self {
            issue_id: issue_id.into(),
            priority,
            boosted: false,
            ready_since: None,
            estimated_tokens,
            variants: 1,
        }
    }

    /// Priority tier used for ranking: one tier up when boosted.
    pub fn effective_tier(&self) -> u8 {
        if self.boosted {
            self.priority.boosted().tier()
        } else {
            self.priority.tier()
        }
    }
}

/// Ranking: effective tier, then boosted first, then longest waiting, then id.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    a.effective_tier()
        .cmp(&b.effective_tier())
        .then(b.boosted.cmp(&a.boosted))
        .then_with(|| match (a.ready_since, b.ready_since) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.issue_id.cmp(&b.issue_id))
}

pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(compare);
}

/// An admitted issue and the resources reserved for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub issue_id: String,
    pub variants: usize,
    pub tokens_per_variant: u64,
}

impl Admission {
    pub fn speculative(&self) -> bool {
        self.variants > 1
    }

    pub fn reserved_tokens(&self) -> u64 {
        self.tokens_per_variant * self.variants as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    WorkcellCeiling,
    TokenCeiling,
}

/// Result of one admission pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionPlan {
    /// In ranked order
    pub admitted: Vec<Admission>,
    /// Would break a ceiling this cycle
    pub skipped: Vec<(String, SkipReason)>,
    /// Estimate exceeds the total token ceiling; never admissible
    pub inadmissible: Vec<String>,
    /// Asked for speculation but only fit as a single workcell
    pub downgraded: Vec<String>,
}

impl AdmissionPlan {
    pub fn reserved_tokens(&self) -> u64 {
        self.admitted.iter().map(Admission::reserved_tokens).sum()
    }
}

pub struct AdmissionController {
    limits: AdmissionLimits,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self { limits }
    }

    /// Rank `candidates` and admit greedily. A candidate that does not fit is
    /// skipped and the walk continues with the next one.
    pub fn admit(&self, mut candidates: Vec<Candidate>, usage: Usage) -> AdmissionPlan {
        rank(&mut candidates);

        let mut plan = AdmissionPlan::default();
        let mut slots = self
            .limits
            .max_workcells
            .saturating_sub(usage.active_workcells);
        let mut tokens = self.limits.max_tokens.saturating_sub(usage.active_tokens);

        for candidate in candidates {
            let estimate = candidate.estimated_tokens;
            if estimate > self.limits.max_tokens {
                tracing::warn!(
                    issue_id = %candidate.issue_id,
                    estimated_tokens = estimate,
                    max_tokens = self.limits.max_tokens,
                    "Issue exceeds token ceiling and can never be admitted"
                );
                plan.inadmissible.push(candidate.issue_id);
                continue;
            }

            if candidate.variants > 1 {
                let wanted = estimate.saturating_mul(candidate.variants as u64);
                if candidate.variants <= slots && wanted <= tokens {
                    slots -= candidate.variants;
                    tokens -= wanted;
                    plan.admitted.push(Admission {
                        issue_id: candidate.issue_id,
                        variants: candidate.variants,
                        tokens_per_variant: estimate,
                    });
                    continue;
                }
                plan.downgraded.push(candidate.issue_id.clone());
            }

            if slots == 0 {
                plan.skipped
                    .push((candidate.issue_id, SkipReason::WorkcellCeiling));
                continue;
            }
            if estimate > tokens {
                plan.skipped.push((candidate.issue_id, SkipReason::TokenCeiling));
                continue;
            }

            slots -= 1;
            tokens -= estimate;
            plan.admitted.push(Admission {
                issue_id: candidate.issue_id,
                variants: 1,
                tokens_per_variant: estimate,
            });
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn boosted_issue_ties_with_next_tier_and_wins() {
        let now = Utc::now();
        let mut starved = Candidate::new("starved", Priority::P2, 1);
        starved.boosted = true;
        starved.ready_since = Some(now - Duration::hours(10));
        let mut fresh = Candidate::new("fresh", Priority::P1, 1);
        fresh.ready_since = Some(now - Duration::hours(20));
        let urgent = Candidate::new("urgent", Priority::P0, 1);

        let mut all = vec![fresh, starved, urgent];
        rank(&mut all);
        let order: Vec<&str> = all.iter().map(|c| c.issue_id.as_str()).collect();
        assert_eq!(order, vec!["urgent", "starved", "fresh"]);
    }

    #[test]
    fn missing_ready_since_sorts_last() {
        let mut a = Candidate::new("a", Priority::P2, 1);
        a.ready_since = None;
        let mut b = Candidate::new("b", Priority::P2, 1);
        b.ready_since = Some(Utc::now());
        assert_eq!(compare(&b, &a), Ordering::Less);
    }
}
