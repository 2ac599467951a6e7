//! Types shared by all task managers.

use std::fmt;

use thiserror::Error;

use crate::job::{Collection, Job, Task, TaskNote};

/// Failure raised by a task manager.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// A transient failure. The task is retried on the next pass.
    #[error("{message}")]
    Recoverable {
        message: String,
        /// HTTP status of the failed response, if there was one.
        status: Option<u16>,
    },

    /// A permanent, understood failure. The task and its job fail.
    #[error("{0}")]
    Irrecoverable(String),

    /// A failure nobody anticipated. The task and its job fail.
    #[error("{0}")]
    Unexpected(String),
}

impl TaskError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        TaskError::Recoverable {
            message: message.into(),
            status: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TaskError::Recoverable { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the error is an HTTP 404 response.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Result of polling a started task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Waiting,
    Running,
    Completed,
    /// Completed, but the external service reported a failure.
    Failed(String),
}

/// What a task manager may read and modify while handling one task.
///
/// Managers write handles and metadata into `job`; note replacements are
/// collected here and committed together with the task's transition.
pub struct TaskScope<'a> {
    pub collection: &'a Collection,
    pub job: &'a mut Job,
    pub task: &'a Task,
    notes: Option<Vec<TaskNote>>,
}

impl<'a> TaskScope<'a> {
    pub fn new(collection: &'a Collection, job: &'a mut Job, task: &'a Task) -> Self {
        Self {
            collection,
            job,
            task,
            notes: None,
        }
    }

    /// Replace every note left on the task by an earlier poll.
    pub fn replace_notes(&mut self, notes: Vec<TaskNote>) {
        self.notes = Some(notes);
    }

    pub fn take_notes(&mut self) -> Option<Vec<TaskNote>> {
        self.notes.take()
    }
}

impl fmt::Display for TaskScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publication {}: Job {}: {}",
            self.collection, self.job, self.task.task_type
        )
    }
}
