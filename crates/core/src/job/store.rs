//! Registry storage trait and types.

use chrono::NaiveDate;
use thiserror::Error;

use super::{Collection, Coverage, Job, JobStatus, NewCollection, Task, TaskNote, TaskType};

/// Error type for registry storage operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("collection not found: {0}")]
    CollectionNotFound(i64),

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("job {job_id} is the active job of collection {collection_id}")]
    ActiveJob { job_id: i64, collection_id: i64 },

    #[error("database error: {0}")]
    Database(String),
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub collection_id: Option<i64>,
    pub status: Option<JobStatus>,
    /// `Some(true)` for completed jobs only, `Some(false)` for incomplete ones.
    pub complete: Option<bool>,
    pub archived: Option<bool>,
    pub keep_all_data: Option<bool>,
    /// Maximum number of results. Unlimited when unset.
    pub limit: Option<i64>,
}

impl JobFilter {
    /// Create a filter matching every job.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection_id: i64) -> Self {
        self.collection_id = Some(collection_id);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Jobs that are not yet `Completed`.
    pub fn incomplete(mut self) -> Self {
        self.complete = Some(false);
        self
    }

    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn with_keep_all_data(mut self, keep_all_data: bool) -> Self {
        self.keep_all_data = Some(keep_all_data);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Collection fields a successful job sets. Every other column is left as
/// stored, so operator edits made during the pass survive.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSuccess {
    pub collection_id: i64,
    pub active_job_id: i64,
    pub last_retrieved: Option<NaiveDate>,
    pub coverage: Coverage,
    /// Only written when the stored policy is blank.
    pub publication_policy: String,
}

/// Everything one advancement of a job changed, committed atomically.
#[derive(Debug, Clone)]
pub struct JobAdvancement {
    pub job: Job,
    /// Tasks whose status, result, note or timestamps changed.
    pub tasks: Vec<Task>,
    /// Per-task note replacements.
    pub notes: Vec<(i64, Vec<TaskNote>)>,
    /// Collection changes made when the job succeeded.
    pub collection: Option<CollectionSuccess>,
}

impl JobAdvancement {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            tasks: Vec::new(),
            notes: Vec::new(),
            collection: None,
        }
    }
}

/// Trait for registry storage backends.
pub trait RegistryStore: Send + Sync {
    /// Register a new collection.
    fn create_collection(&self, request: NewCollection) -> Result<Collection, RegistryError>;

    fn get_collection(&self, id: i64) -> Result<Option<Collection>, RegistryError>;

    /// All collections, ordered by ID.
    fn list_collections(&self) -> Result<Vec<Collection>, RegistryError>;

    /// Persist every mutable field of a collection.
    fn update_collection(&self, collection: &Collection) -> Result<(), RegistryError>;

    /// Create a planned job and one planned task per plan entry, in one transaction.
    fn create_job(&self, collection_id: i64, plan: &[TaskType]) -> Result<Job, RegistryError>;

    fn get_job(&self, id: i64) -> Result<Option<Job>, RegistryError>;

    /// Jobs matching the filter, ordered by ID.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError>;

    /// Persist every mutable field of a job.
    fn update_job(&self, job: &Job) -> Result<(), RegistryError>;

    /// Tasks of a job in ascending order.
    fn tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>, RegistryError>;

    fn task_notes(&self, task_id: i64) -> Result<Vec<TaskNote>, RegistryError>;

    /// Commit one job advancement in a single transaction.
    fn save_advancement(&self, advancement: &JobAdvancement) -> Result<(), RegistryError>;

    /// Delete a job with its tasks and notes.
    ///
    /// Refused while the job is its collection's active job.
    fn delete_job(&self, id: i64) -> Result<(), RegistryError>;
}
