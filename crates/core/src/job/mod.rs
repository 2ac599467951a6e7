//! Collections, their retrieval jobs and the tasks that make up a job.

mod sqlite_store;
mod store;
mod types;

pub(crate) use sqlite_store::BUSY_TIMEOUT;
pub use sqlite_store::SqliteRegistryStore;
pub use store::{CollectionSuccess, JobAdvancement, JobFilter, RegistryError, RegistryStore};
pub use types::{
    Collection, Coverage, Job, JobContext, JobStatus, NewCollection, NoteLevel,
    RetrievalFrequency, Task, TaskNote, TaskResult, TaskStatus, TaskType,
};
