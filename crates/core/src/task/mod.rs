//! Task managers: one per pipeline step, each driving an external service.

mod collect;
mod exporter;
mod factory;
mod flattener;
mod http;
mod pelican;
mod process;
mod scrapy_log;
mod traits;
mod types;

pub use collect::CollectTaskManager;
pub use exporter::ExporterTaskManager;
pub use factory::ServiceTaskManagers;
pub use flattener::FlattenerTaskManager;
pub use pelican::PelicanTaskManager;
pub use process::{parse_date, ProcessTaskManager};
pub use scrapy_log::{LogEntry, LogLevel, ScrapyLog};
pub use traits::{TaskManager, TaskManagerFactory};
pub use types::{TaskError, TaskPoll, TaskScope};
