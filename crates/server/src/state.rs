use std::sync::Arc;

use registry_core::{Config, MessageQueue, ProcessManager, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    manager: Arc<ProcessManager>,
    queue: Arc<dyn MessageQueue>,
}

impl AppState {
    pub fn new(config: Config, manager: Arc<ProcessManager>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            config,
            manager,
            queue,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn manager(&self) -> &ProcessManager {
        self.manager.as_ref()
    }

    pub fn queue(&self) -> &dyn MessageQueue {
        self.queue.as_ref()
    }
}
