//! Cyntra Kernel - coordinator for automated code-change agents
//!
//! This crate schedules issues from a dependency graph into isolated
//! workcells (git worktrees) under concurrency and token ceilings, runs
//! toolchain adapters in them, checks the results through quality gates,
//! and resolves speculative multi-variant attempts by vote.

pub mod adapters;
pub mod config;
pub mod error;
pub mod kernel;
pub mod observability;
pub mod state;
pub mod workcell;

pub use config::KernelConfig;
pub use error::KernelError;
pub use kernel::{AdmissionController, Dispatcher, KernelRunner, Scheduler, SpeculationEngine, Verifier};
pub use state::{BeadsTracker, Issue, IssueGraph, IssueTracker};
pub use workcell::WorkcellManager;
