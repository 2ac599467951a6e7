//! Testing utilities and mock implementations.
//!
//! The mocks stand in for the external services behind each task type, so
//! the process manager can be driven end to end against an in-memory store.
//!
//! # Example
//!
//! ```rust,ignore
//! use registry_core::testing::MockTaskManagers;
//!
//! let managers = MockTaskManagers::new();
//! managers
//!     .manager_for(TaskType::Collect)
//!     .push_poll(Ok(TaskPoll::Running))
//!     .await;
//!
//! // Hand `Arc::new(managers.clone())` to a ProcessManager...
//! ```

mod mock_task_manager;

pub use mock_task_manager::{MockTaskManager, MockTaskManagers, RecordedTaskCall, TaskCall};

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;

    use crate::job::{
        Collection, Coverage, Job, JobContext, JobStatus, Task, TaskStatus, TaskType,
    };

    /// A collection with no schedule, not frozen and no active job.
    pub fn collection(id: i64, source_id: &str) -> Collection {
        Collection {
            id,
            source_id: source_id.to_string(),
            title: source_id.to_string(),
            country: String::new(),
            retrieval_frequency: None,
            frozen: false,
            last_retrieved: None,
            publication_policy: String::new(),
            coverage: Coverage::default(),
            active_job_id: None,
            created_at: Utc::now(),
        }
    }

    /// A planned job with an empty context.
    pub fn job(id: i64, collection_id: i64) -> Job {
        Job {
            id,
            collection_id,
            status: JobStatus::Planned,
            start: None,
            end: None,
            context: JobContext::default(),
            keep_all_data: false,
            archived: false,
            date_from: None,
            date_to: None,
            license: String::new(),
            publication_policy: String::new(),
            ocid_prefix: String::new(),
            coverage: Coverage::default(),
            created_at: Utc::now(),
        }
    }

    /// A planned task.
    pub fn task(id: i64, job_id: i64, order: u32, task_type: TaskType) -> Task {
        Task {
            id,
            job_id,
            order,
            task_type,
            status: TaskStatus::Planned,
            result: None,
            note: String::new(),
            start: None,
            end: None,
        }
    }
}
