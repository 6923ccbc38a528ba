//! State management - issue model, graph snapshots and tracker backends.

mod graph;
mod issue;
mod tracker;

pub use graph::{IssueGraph, ReadinessChange};
pub use issue::{Issue, IssueSize, IssueStatus, Priority, RiskLevel};
pub use tracker::{BeadsTracker, IssueTracker, MemoryTracker};

pub(crate) use tracker::write_atomic;
