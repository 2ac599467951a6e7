//! Task manager traits.

use std::sync::Arc;

use async_trait::async_trait;

use super::{TaskError, TaskPoll, TaskScope};
use crate::job::TaskType;

/// Drives one kind of task against its external service.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Human-readable name (e.g., "collect").
    fn name(&self) -> &str;

    /// Whether the task produces a retained deliverable.
    ///
    /// The cleanup sweep never wipes final outputs.
    fn final_output(&self) -> bool;

    /// Start the external work. Called once per task.
    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError>;

    /// Poll the external work. Only called after `run` succeeded.
    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError>;

    /// Delete the task's side effects.
    ///
    /// Must tolerate a task that never ran and must be safe to repeat.
    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError>;
}

/// Resolves the task manager responsible for a task type.
pub trait TaskManagerFactory: Send + Sync {
    fn manager(&self, task_type: TaskType) -> Result<Arc<dyn TaskManager>, TaskError>;
}
