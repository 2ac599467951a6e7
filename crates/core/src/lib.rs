pub mod config;
pub mod export;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod task;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, CrawlerConfig,
    SanitizedConfig, ServiceConfig,
};
pub use export::{Export, ExportError, ExportStatus, Wiper, WiperError};
pub use job::{
    Collection, CollectionSuccess, Coverage, Job, JobAdvancement, JobContext, JobFilter, JobStatus, NewCollection,
    NoteLevel, RegistryError, RegistryStore, RetrievalFrequency, SqliteRegistryStore, Task,
    TaskNote, TaskResult, TaskStatus, TaskType,
};
pub use orchestrator::{
    CleanupSummary, OrchestratorConfig, OrchestratorError, OrchestratorStatus, PassSummary,
    ProcessManager,
};
pub use queue::{Delivery, MessageQueue, QueueError, RoutingKey, SqliteMessageQueue};
pub use task::{
    ServiceTaskManagers, TaskError, TaskManager, TaskManagerFactory, TaskPoll, TaskScope,
};
