//! Builds the task managers from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    CollectTaskManager, ExporterTaskManager, FlattenerTaskManager, PelicanTaskManager,
    ProcessTaskManager, TaskError, TaskManager, TaskManagerFactory,
};
use crate::config::Config;
use crate::job::TaskType;
use crate::queue::MessageQueue;

/// Task managers backed by the configured external services.
///
/// Managers are built once and shared. A task type whose service isn't
/// configured has no manager.
pub struct ServiceTaskManagers {
    managers: HashMap<TaskType, Arc<dyn TaskManager>>,
}

impl ServiceTaskManagers {
    pub fn from_config(config: &Config, queue: Arc<dyn MessageQueue>) -> Result<Self, TaskError> {
        let mut managers: HashMap<TaskType, Arc<dyn TaskManager>> = HashMap::new();

        if let Some(crawler) = &config.crawler {
            managers.insert(
                TaskType::Collect,
                Arc::new(CollectTaskManager::new(
                    crawler,
                    config.orchestrator.error_rate_threshold,
                )?),
            );
        }
        if let Some(process) = &config.process {
            managers.insert(TaskType::Process, Arc::new(ProcessTaskManager::new(process)?));
        }
        if let Some(pelican) = &config.pelican {
            managers.insert(TaskType::Pelican, Arc::new(PelicanTaskManager::new(pelican)?));
        }

        let export_dir = config.exporter.export_dir.clone();
        managers.insert(
            TaskType::Exporter,
            Arc::new(ExporterTaskManager::new(
                Arc::clone(&queue),
                export_dir.clone(),
            )),
        );
        managers.insert(
            TaskType::Flattener,
            Arc::new(FlattenerTaskManager::new(queue, export_dir)),
        );

        Ok(Self { managers })
    }
}

impl TaskManagerFactory for ServiceTaskManagers {
    fn manager(&self, task_type: TaskType) -> Result<Arc<dyn TaskManager>, TaskError> {
        self.managers.get(&task_type).cloned().ok_or_else(|| {
            TaskError::Unexpected(format!("No task manager configured for {}", task_type))
        })
    }
}
