//! Issue graph - immutable per-cycle snapshot of issues and blocking edges.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::issue::{Issue, IssueStatus};

/// A status correction required to restore the readiness invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessChange {
    pub issue_id: String,
    pub from: IssueStatus,
    pub to: IssueStatus,
}

/// Snapshot of the work graph.
///
/// Built fresh from the tracker every cycle; never patched incrementally.
#[derive(Debug, Default, Clone)]
pub struct IssueGraph {
    /// All issues by ID
    issues: BTreeMap<String, Issue>,
    /// Reverse edges: blocker -> issues waiting on it
    dependents: HashMap<String, Vec<String>>,
}

impl IssueGraph {
    pub fn from_issues(issues: impl IntoIterator<Item = Issue>) -> Self {
        let issues: BTreeMap<String, Issue> =
            issues.into_iter().map(|i| (i.id.clone(), i)).collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for issue in issues.values() {
            for blocker in &issue.depends_on {
                dependents
                    .entry(blocker.clone())
                    .or_default()
                    .push(issue.id.clone());
            }
        }

        Self { issues, dependents }
    }

    /// Get all issues
    pub fn all_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    /// Get an issue by ID
    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Every blocker is present in the snapshot and done.
    pub fn blockers_done(&self, issue: &Issue) -> bool {
        issue.depends_on.iter().all(|dep| {
            self.issues
                .get(dep)
                .is_some_and(|b| b.status == IssueStatus::Done)
        })
    }

    /// Check if an issue is eligible for admission
    pub fn is_ready(&self, issue: &Issue) -> bool {
        matches!(issue.status, IssueStatus::Open | IssueStatus::Ready) && self.blockers_done(issue)
    }

    /// Get all ready issues (open or ready with all deps done)
    pub fn ready_issues(&self) -> Vec<&Issue> {
        self.issues.values().filter(|i| self.is_ready(i)).collect()
    }

    /// Status corrections so that `ready` holds exactly when all blockers are done.
    pub fn readiness_changes(&self) -> Vec<ReadinessChange> {
        self.issues
            .values()
            .filter_map(|issue| {
                let done = self.blockers_done(issue);
                let to = match issue.status {
                    IssueStatus::Open if done => IssueStatus::Ready,
                    IssueStatus::Ready if !done => IssueStatus::Open,
                    _ => return None,
                };
                Some(ReadinessChange {
                    issue_id: issue.id.clone(),
                    from: issue.status,
                    to,
                })
            })
            .collect()
    }

    /// Blocker IDs referenced by some issue but missing from the snapshot.
    pub fn dangling_blockers(&self) -> Vec<(&str, &str)> {
        self.issues
            .values()
            .flat_map(|issue| {
                issue
                    .depends_on
                    .iter()
                    .filter(|dep| !self.issues.contains_key(dep.as_str()))
                    .map(move |dep| (issue.id.as_str(), dep.as_str()))
            })
            .collect()
    }

    /// Whether any issue that is not yet done transitively waits on `id`.
    pub fn has_pending_dependents(&self, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(&current).into_iter().flatten() {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                if self
                    .issues
                    .get(dependent)
                    .is_some_and(|i| i.status != IssueStatus::Done)
                {
                    return true;
                }
                queue.push_back(dependent.clone());
            }
        }

        false
    }

    /// Longest chain of unfinished work, weighted by size hours.
    pub fn critical_path(&self) -> Vec<&Issue> {
        let pending: Vec<&Issue> = self
            .issues
            .values()
            .filter(|i| i.status != IssueStatus::Done)
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        // Kahn's algorithm over edges blocker -> dependent among pending issues
        let mut in_degree: HashMap<&str, usize> =
            pending.iter().map(|i| (i.id.as_str(), 0)).collect();
        for issue in &pending {
            for dep in &issue.depends_on {
                if in_degree.contains_key(dep.as_str()) {
                    *in_degree.entry(issue.id.as_str()).or_default() += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = pending
            .iter()
            .map(|i| i.id.as_str())
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut dist: HashMap<&str, u32> = pending
            .iter()
            .map(|i| (i.id.as_str(), i.size.hours()))
            .collect();
        let mut parent: HashMap<&str, &str> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            for dependent in self.dependents.get(node).into_iter().flatten() {
                let Some(remaining) = in_degree.get_mut(dependent.as_str()) else {
                    continue;
                };
                let weight = self.issues[dependent].size.hours();
                if dist[node] + weight > dist[dependent.as_str()] {
                    dist.insert(dependent.as_str(), dist[node] + weight);
                    parent.insert(dependent.as_str(), node);
                }
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }

        let Some((&end, _)) = dist.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) else {
            return Vec::new();
        };

        let mut path = vec![&self.issues[end]];
        let mut current = end;
        while let Some(&prev) = parent.get(current) {
            path.push(&self.issues[prev]);
            current = prev;
        }
        path.reverse();
        path
    }

    /// Count issues per status.
    pub fn status_counts(&self) -> BTreeMap<IssueStatus, usize> {
        let mut counts = BTreeMap::new();
        for issue in self.issues.values() {
            *counts.entry(issue.status).or_default() += 1;
        }
        counts
    }
}
