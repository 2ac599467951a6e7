//! Durable work queue between the process manager and export workers.

mod sqlite;
mod types;

pub use sqlite::SqliteMessageQueue;
pub use types::{Delivery, MessageQueue, QueueError, RoutingKey};
