//! Mock task managers for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::job::{TaskNote, TaskType};
use crate::task::{TaskError, TaskManager, TaskManagerFactory, TaskPoll, TaskScope};

/// Which trait method a recorded call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCall {
    Run,
    GetStatus,
    Wipe,
}

/// A recorded call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTaskCall {
    pub job_id: i64,
    pub task_id: i64,
    pub call: TaskCall,
}

/// Mock implementation of the TaskManager trait.
///
/// Results are scripted per method and consumed in order. Once a script is
/// empty, `run` and `wipe` succeed and `get_status` reports completion.
/// Clones share their state, so a test can keep a handle to a manager it
/// handed to [`MockTaskManagers`].
///
/// # Example
///
/// ```rust,ignore
/// use registry_core::testing::MockTaskManager;
///
/// let collect = MockTaskManager::new(TaskType::Collect);
/// collect.push_poll(Ok(TaskPoll::Running)).await;
/// collect.push_poll(Err(TaskError::recoverable("timeout"))).await;
///
/// // ... run the process manager ...
///
/// assert_eq!(collect.poll_count().await, 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockTaskManager {
    task_type: TaskType,
    final_output: bool,
    runs: Arc<RwLock<VecDeque<Result<(), TaskError>>>>,
    polls: Arc<RwLock<VecDeque<Result<TaskPoll, TaskError>>>>,
    wipes: Arc<RwLock<VecDeque<Result<(), TaskError>>>>,
    /// Replaces the task's notes on the next `get_status`.
    notes: Arc<RwLock<Option<Vec<TaskNote>>>>,
    calls: Arc<RwLock<Vec<RecordedTaskCall>>>,
}

impl MockTaskManager {
    /// Create a mock for a task type. Exporter and flattener are final output.
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            final_output: matches!(task_type, TaskType::Exporter | TaskType::Flattener),
            runs: Arc::new(RwLock::new(VecDeque::new())),
            polls: Arc::new(RwLock::new(VecDeque::new())),
            wipes: Arc::new(RwLock::new(VecDeque::new())),
            notes: Arc::new(RwLock::new(None)),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn push_run(&self, result: Result<(), TaskError>) {
        self.runs.write().await.push_back(result);
    }

    pub async fn push_poll(&self, result: Result<TaskPoll, TaskError>) {
        self.polls.write().await.push_back(result);
    }

    pub async fn push_wipe(&self, result: Result<(), TaskError>) {
        self.wipes.write().await.push_back(result);
    }

    pub async fn set_notes(&self, notes: Vec<TaskNote>) {
        *self.notes.write().await = Some(notes);
    }

    pub async fn recorded_calls(&self) -> Vec<RecordedTaskCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_recorded(&self) {
        self.calls.write().await.clear();
    }

    pub async fn run_count(&self) -> usize {
        self.count(TaskCall::Run).await
    }

    pub async fn poll_count(&self) -> usize {
        self.count(TaskCall::GetStatus).await
    }

    pub async fn wipe_count(&self) -> usize {
        self.count(TaskCall::Wipe).await
    }

    async fn count(&self, call: TaskCall) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|recorded| recorded.call == call)
            .count()
    }

    async fn record(&self, scope: &TaskScope<'_>, call: TaskCall) {
        self.calls.write().await.push(RecordedTaskCall {
            job_id: scope.job.id,
            task_id: scope.task.id,
            call,
        });
    }
}

#[async_trait]
impl TaskManager for MockTaskManager {
    fn name(&self) -> &str {
        self.task_type.as_str()
    }

    fn final_output(&self) -> bool {
        self.final_output
    }

    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        self.record(scope, TaskCall::Run).await;
        self.runs.write().await.pop_front().unwrap_or(Ok(()))
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        self.record(scope, TaskCall::GetStatus).await;
        if let Some(notes) = self.notes.write().await.take() {
            scope.replace_notes(notes);
        }
        self.polls
            .write()
            .await
            .pop_front()
            .unwrap_or(Ok(TaskPoll::Completed))
    }

    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        self.record(scope, TaskCall::Wipe).await;
        self.wipes.write().await.pop_front().unwrap_or(Ok(()))
    }
}

/// Mock task manager factory with one [`MockTaskManager`] per task type.
#[derive(Debug, Clone)]
pub struct MockTaskManagers {
    managers: HashMap<TaskType, MockTaskManager>,
}

impl Default for MockTaskManagers {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTaskManagers {
    pub fn new() -> Self {
        let managers = TaskType::ALL
            .into_iter()
            .map(|task_type| (task_type, MockTaskManager::new(task_type)))
            .collect();
        Self { managers }
    }

    /// Drop the manager for a task type, as if its service were unconfigured.
    pub fn without(mut self, task_type: TaskType) -> Self {
        self.managers.remove(&task_type);
        self
    }

    /// Handle to the mock for a task type, sharing its state.
    ///
    /// # Panics
    ///
    /// If the task type was removed with [`MockTaskManagers::without`].
    pub fn manager_for(&self, task_type: TaskType) -> MockTaskManager {
        self.managers
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| panic!("no mock for {}", task_type))
    }
}

impl TaskManagerFactory for MockTaskManagers {
    fn manager(&self, task_type: TaskType) -> Result<Arc<dyn TaskManager>, TaskError> {
        self.managers
            .get(&task_type)
            .map(|manager| Arc::new(manager.clone()) as Arc<dyn TaskManager>)
            .ok_or_else(|| {
                TaskError::Unexpected(format!("No task manager configured for {}", task_type))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_scripted_results_then_defaults() {
        let manager = MockTaskManager::new(TaskType::Process);
        manager.push_poll(Ok(TaskPoll::Running)).await;

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(2, 1);
        let task = fixtures::task(3, 2, 1, TaskType::Process);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Running);
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Completed);
        assert!(manager.run(&mut scope).await.is_ok());

        assert_eq!(manager.poll_count().await, 2);
        assert_eq!(manager.run_count().await, 1);
        assert_eq!(
            manager.recorded_calls().await[0],
            RecordedTaskCall {
                job_id: 2,
                task_id: 3,
                call: TaskCall::GetStatus
            }
        );
    }

    #[tokio::test]
    async fn test_factory_shares_state() {
        let managers = MockTaskManagers::new();
        assert!(managers.manager_for(TaskType::Exporter).final_output());
        assert!(!managers.manager_for(TaskType::Collect).final_output());

        managers
            .manager_for(TaskType::Collect)
            .push_run(Err(TaskError::recoverable("refused")))
            .await;

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(2, 1);
        let task = fixtures::task(3, 2, 1, TaskType::Collect);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        let manager = managers.manager(TaskType::Collect).ok().unwrap();
        assert!(manager.run(&mut scope).await.is_err());
        assert_eq!(managers.manager_for(TaskType::Collect).run_count().await, 1);
    }

    #[test]
    fn test_without() {
        let managers = MockTaskManagers::new().without(TaskType::Pelican);
        assert!(managers.manager(TaskType::Pelican).is_err());
        assert!(managers.manager(TaskType::Process).is_ok());
    }
}
