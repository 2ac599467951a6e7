//! Flatten task: asks the export workers to convert each JSON lines export to CSV.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::exporter::export_poll;
use super::{TaskError, TaskManager, TaskPoll, TaskScope};
use crate::export::{flattened_name, Export, ExportStatus};
use crate::queue::{MessageQueue, RoutingKey};

pub struct FlattenerTaskManager {
    queue: Arc<dyn MessageQueue>,
    export_dir: PathBuf,
}

impl FlattenerTaskManager {
    pub fn new(queue: Arc<dyn MessageQueue>, export_dir: PathBuf) -> Self {
        Self { queue, export_dir }
    }
}

#[async_trait]
impl TaskManager for FlattenerTaskManager {
    fn name(&self) -> &str {
        "flattener"
    }

    fn final_output(&self) -> bool {
        true
    }

    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let export = Export::new(&self.export_dir, scope.job.id);
        if export.locked() {
            warn!("{}: Removing stale lock {}", scope, export.lock_file().display());
            export
                .unlock()
                .map_err(|e| TaskError::recoverable(format!("Unable to unlock export: {}", e)))?;
        }

        self.queue
            .publish(RoutingKey::FlattenStart, &json!({"job_id": scope.job.id}))
            .map_err(|e| TaskError::recoverable(format!("Unable to request flattening: {}", e)))?;

        info!("{}: Requested flattening", scope);
        Ok(())
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        let export = Export::new(&self.export_dir, scope.job.id);
        if export.locked() {
            return Ok(TaskPoll::Running);
        }

        let files = export.convertible_files();
        if files.is_empty() {
            return Ok(TaskPoll::Waiting);
        }

        Ok(files
            .iter()
            .map(|name| export.file_status(&flattened_name(name)))
            .find(|status| *status != ExportStatus::Completed)
            .map(export_poll)
            .unwrap_or(TaskPoll::Completed))
    }

    /// The export wipe removes the whole directory, flattened files included.
    async fn wipe(&self, _scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::FULL_EXPORT;
    use crate::job::TaskType;
    use crate::queue::SqliteMessageQueue;
    use crate::testing::fixtures;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SqliteMessageQueue>, FlattenerTaskManager) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SqliteMessageQueue::in_memory().unwrap());
        let manager = FlattenerTaskManager::new(
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            dir.path().to_path_buf(),
        );
        (dir, queue, manager)
    }

    #[tokio::test]
    async fn test_run_unlocks_and_publishes() {
        let (dir, queue, manager) = setup();
        let export = Export::new(dir.path(), 10);
        export.lock().unwrap();

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(104, 10, 5, TaskType::Flattener);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        manager.run(&mut scope).await.unwrap();

        assert!(!export.locked());
        let delivery = queue.receive(RoutingKey::FlattenStart, "test").unwrap().unwrap();
        assert_eq!(delivery.body, json!({"job_id": 10}));
    }

    #[tokio::test]
    async fn test_status_waits_for_every_file() {
        let (dir, _queue, manager) = setup();
        let export = Export::new(dir.path(), 10);
        std::fs::create_dir_all(export.directory()).unwrap();
        std::fs::write(export.directory().join(FULL_EXPORT), b"").unwrap();
        std::fs::write(export.directory().join("2023.jsonl.gz"), b"").unwrap();

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(104, 10, 5, TaskType::Flattener);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Waiting);

        std::fs::write(export.directory().join("2023.csv.tar.gz"), b"").unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Waiting);

        export.lock().unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Running);
        export.unlock().unwrap();

        std::fs::write(export.directory().join("full.csv.tar.gz"), b"").unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Completed);
    }

    #[tokio::test]
    async fn test_status_without_exports_is_waiting() {
        let (dir, _queue, manager) = setup();
        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(104, 10, 5, TaskType::Flattener);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        // No directory yet.
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Waiting);

        let export = Export::new(dir.path(), 10);
        std::fs::create_dir_all(export.directory()).unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Waiting);
    }

    #[tokio::test]
    async fn test_status_locked_without_exports_is_running() {
        let (dir, _queue, manager) = setup();
        let export = Export::new(dir.path(), 10);
        export.lock().unwrap();

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(104, 10, 5, TaskType::Flattener);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Running);
    }

    #[tokio::test]
    async fn test_wipe_twice_is_noop() {
        let (dir, queue, manager) = setup();
        let export = Export::new(dir.path(), 10);
        std::fs::create_dir_all(export.directory()).unwrap();
        std::fs::write(export.directory().join(FULL_EXPORT), b"").unwrap();

        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(104, 10, 5, TaskType::Flattener);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        manager.wipe(&mut scope).await.unwrap();
        manager.wipe(&mut scope).await.unwrap();

        assert!(export.directory().join(FULL_EXPORT).exists());
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);
    }
}
