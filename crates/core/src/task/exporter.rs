//! Export task: asks the export workers to write the compiled collection to disk.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{TaskError, TaskManager, TaskPoll, TaskScope};
use crate::export::{Export, ExportStatus};
use crate::queue::{MessageQueue, RoutingKey};

pub struct ExporterTaskManager {
    queue: Arc<dyn MessageQueue>,
    export_dir: PathBuf,
}

impl ExporterTaskManager {
    pub fn new(queue: Arc<dyn MessageQueue>, export_dir: PathBuf) -> Self {
        Self { queue, export_dir }
    }
}

pub(crate) fn export_poll(status: ExportStatus) -> TaskPoll {
    match status {
        ExportStatus::Waiting => TaskPoll::Waiting,
        ExportStatus::Running => TaskPoll::Running,
        ExportStatus::Completed => TaskPoll::Completed,
    }
}

#[async_trait]
impl TaskManager for ExporterTaskManager {
    fn name(&self) -> &str {
        "exporter"
    }

    fn final_output(&self) -> bool {
        true
    }

    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let body = json!({
            "job_id": scope.job.id,
            "collection_id": scope.job.context.process_compiled_collection_id,
            "spider": scope.job.context.spider,
        });
        self.queue
            .publish(RoutingKey::ExportStart, &body)
            .map_err(|e| TaskError::recoverable(format!("Unable to request export: {}", e)))?;

        info!("{}: Requested export", scope);
        Ok(())
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        Ok(export_poll(
            Export::new(&self.export_dir, scope.job.id).status(),
        ))
    }

    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        if scope.task.start.is_none() {
            debug!("{}: Export never started, nothing to wipe", scope);
            return Ok(());
        }

        self.queue
            .publish(RoutingKey::ExportWipe, &json!({"job_id": scope.job.id}))
            .map_err(|e| TaskError::recoverable(format!("Unable to request export wipe: {}", e)))?;

        info!("{}: Requested export wipe", scope);
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
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SqliteMessageQueue>, ExporterTaskManager) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SqliteMessageQueue::in_memory().unwrap());
        let manager = ExporterTaskManager::new(
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            dir.path().to_path_buf(),
        );
        (dir, queue, manager)
    }

    #[tokio::test]
    async fn test_run_publishes_export_start() {
        let (_dir, queue, manager) = setup();
        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        job.context.spider = Some("spider_a".to_string());
        job.context.process_compiled_collection_id = Some(2);
        let task = fixtures::task(103, 10, 4, TaskType::Exporter);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        manager.run(&mut scope).await.unwrap();

        let delivery = queue.receive(RoutingKey::ExportStart, "test").unwrap().unwrap();
        assert_eq!(
            delivery.body,
            json!({"job_id": 10, "collection_id": 2, "spider": "spider_a"})
        );
    }

    #[tokio::test]
    async fn test_status_follows_export_directory() {
        let (dir, _queue, manager) = setup();
        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let task = fixtures::task(103, 10, 4, TaskType::Exporter);
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Waiting);

        let export = Export::new(dir.path(), 10);
        export.lock().unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Running);

        std::fs::write(export.directory().join(FULL_EXPORT), b"").unwrap();
        export.unlock().unwrap();
        assert_eq!(manager.get_status(&mut scope).await.unwrap(), TaskPoll::Completed);
    }

    #[tokio::test]
    async fn test_wipe_requires_started_task() {
        let (_dir, queue, manager) = setup();
        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let mut task = fixtures::task(103, 10, 4, TaskType::Exporter);

        {
            let mut scope = TaskScope::new(&collection, &mut job, &task);
            manager.wipe(&mut scope).await.unwrap();
        }
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);

        task.start = Some(Utc::now());
        let mut scope = TaskScope::new(&collection, &mut job, &task);
        manager.wipe(&mut scope).await.unwrap();
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wipe_twice_publishes_each_time() {
        let (_dir, queue, manager) = setup();
        let collection = fixtures::collection(1, "spider_a");
        let mut job = fixtures::job(10, 1);
        let mut task = fixtures::task(103, 10, 4, TaskType::Exporter);
        task.start = Some(Utc::now());
        let mut scope = TaskScope::new(&collection, &mut job, &task);

        manager.wipe(&mut scope).await.unwrap();
        manager.wipe(&mut scope).await.unwrap();

        // The wiper treats a missing directory as already wiped.
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 2);
    }
}
