//! Process manager for automated collection processing.
//!
//! A pass plans a job for every due collection and advances incomplete jobs
//! through their tasks (collect, process, pelican, exporter, flattener).
//! A separate cleanup sweep wipes temporary data of completed jobs.

mod config;
mod machine;
mod planner;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use machine::{transition, Flow, IllegalTransition, Outcome, Transition};
pub use planner::should_be_planned;
pub use runner::ProcessManager;
pub use types::{
    CleanupSummary, CollectionReport, JobOutcome, OrchestratorError, OrchestratorStatus,
    PassSummary,
};
