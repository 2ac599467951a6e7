//! Types for the process manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::machine::IllegalTransition;
use crate::job::RegistryError;
use crate::task::TaskError;

/// Errors that can occur while processing collections.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("collection not found: {0}")]
    CollectionNotFound(i64),

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("{0}")]
    Transition(#[from] IllegalTransition),
}

/// How one advancement left a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Already complete; nothing was done.
    Unchanged,
    /// Some tasks progressed; the job is still running.
    Progressed,
    Succeeded,
    Failed,
}

/// What processing one collection did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    /// The job planned in this pass, if any.
    pub planned_job: Option<i64>,
    pub jobs_advanced: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    /// Jobs whose advancement raised a store error.
    pub errors: usize,
}

impl CollectionReport {
    pub(crate) fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Unchanged => {}
            JobOutcome::Progressed => self.jobs_advanced += 1,
            JobOutcome::Succeeded => {
                self.jobs_advanced += 1;
                self.jobs_succeeded += 1;
            }
            JobOutcome::Failed => {
                self.jobs_advanced += 1;
                self.jobs_failed += 1;
            }
        }
    }
}

/// Totals of one pass over all collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collections: usize,
    pub jobs_planned: usize,
    pub jobs_advanced: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    /// Collections or jobs that could not be processed.
    pub errors: usize,
}

impl PassSummary {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            collections: 0,
            jobs_planned: 0,
            jobs_advanced: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            errors: 0,
        }
    }

    pub(crate) fn add(&mut self, report: &CollectionReport) {
        self.collections += 1;
        self.jobs_planned += usize::from(report.planned_job.is_some());
        self.jobs_advanced += report.jobs_advanced;
        self.jobs_succeeded += report.jobs_succeeded;
        self.jobs_failed += report.jobs_failed;
        self.errors += report.errors;
    }
}

/// Totals of one cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub archived: usize,
    /// Jobs left unarchived because a wipe failed; retried next sweep.
    pub failed: usize,
}

/// Current status of the process manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether the serve loops are running.
    pub running: bool,
    pub last_pass: Option<PassSummary>,
    pub last_cleanup: Option<CleanupSummary>,
    pub collections: usize,
    pub incomplete_jobs: usize,
}
