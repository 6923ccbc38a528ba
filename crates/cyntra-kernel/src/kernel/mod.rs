//! Kernel - admission, scheduling, dispatching, speculation and verification.

mod admission;
mod dispatcher;
mod runner;
mod scheduler;
mod speculation;
mod verifier;

pub use admission::{
    compare, rank, Admission, AdmissionController, AdmissionLimits, AdmissionPlan, Candidate,
    SkipReason, Usage,
};
pub use dispatcher::Dispatcher;
pub use runner::{CycleReport, IssueOutcome, KernelRunner};
pub use scheduler::{ScheduleResult, Scheduler};
pub use speculation::{
    qualifies, resolve_votes, BatchState, Resolution, SpeculationBatch, SpeculationEngine,
};
pub use verifier::{GateOutcome, GateReport, QualityGateResult, Verdict, Verifier};
