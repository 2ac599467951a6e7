//! SQLite-backed message queue.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use super::{Delivery, MessageQueue, QueueError, RoutingKey};
use crate::job::BUSY_TIMEOUT;
use crate::metrics::{QUEUE_ACKED, QUEUE_PUBLISHED};

/// Durable queue stored in a `messages` table.
///
/// Shares the registry database file; publishers and consumers in separate
/// processes coordinate through SQLite's locking.
pub struct SqliteMessageQueue {
    conn: Mutex<Connection>,
}

impl SqliteMessageQueue {
    pub fn new(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(storage_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(storage_error)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(storage_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory queue (useful for testing).
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                routing_key TEXT NOT NULL,
                body TEXT NOT NULL,
                published_at TEXT NOT NULL,
                delivered_at TEXT,
                consumer TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                acked_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_ready ON messages(routing_key, acked_at, delivered_at);
            "#,
        )
        .map_err(storage_error)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Storage("connection mutex poisoned".to_string()))
    }
}

impl MessageQueue for SqliteMessageQueue {
    fn publish(&self, routing_key: RoutingKey, body: &Value) -> Result<i64, QueueError> {
        let conn = self.conn()?;
        let body = serde_json::to_string(body).map_err(|e| QueueError::InvalidBody(e.to_string()))?;

        conn.execute(
            "INSERT INTO messages (routing_key, body, published_at) VALUES (?, ?, ?)",
            params![routing_key.as_str(), body, now()],
        )
        .map_err(storage_error)?;

        let id = conn.last_insert_rowid();
        QUEUE_PUBLISHED
            .with_label_values(&[routing_key.as_str()])
            .inc();
        debug!(message_id = id, routing_key = %routing_key, "Published message");
        Ok(id)
    }

    fn receive(
        &self,
        routing_key: RoutingKey,
        consumer: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_error)?;

        let in_flight: Option<i64> = tx
            .query_row(
                "SELECT id FROM messages WHERE routing_key = ? AND consumer = ? AND delivered_at IS NOT NULL AND acked_at IS NULL LIMIT 1",
                params![routing_key.as_str(), consumer],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;
        if in_flight.is_some() {
            return Ok(None);
        }

        let next: Option<(i64, String, u32)> = tx
            .query_row(
                "SELECT id, body, attempts FROM messages WHERE routing_key = ? AND delivered_at IS NULL AND acked_at IS NULL ORDER BY id LIMIT 1",
                params![routing_key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage_error)?;

        let Some((id, body, attempts)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE messages SET delivered_at = ?, consumer = ?, attempts = attempts + 1 WHERE id = ?",
            params![now(), consumer, id],
        )
        .map_err(storage_error)?;
        tx.commit().map_err(storage_error)?;

        let body: Value =
            serde_json::from_str(&body).map_err(|e| QueueError::InvalidBody(e.to_string()))?;

        Ok(Some(Delivery {
            id,
            routing_key,
            body,
            attempts: attempts + 1,
        }))
    }

    fn ack(&self, delivery_id: i64) -> Result<(), QueueError> {
        let conn = self.conn()?;

        let routing_key: Option<String> = conn
            .query_row(
                "SELECT routing_key FROM messages WHERE id = ? AND delivered_at IS NOT NULL AND acked_at IS NULL",
                params![delivery_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;
        let Some(routing_key) = routing_key else {
            return Err(QueueError::UnknownDelivery(delivery_id));
        };

        conn.execute(
            "UPDATE messages SET acked_at = ? WHERE id = ?",
            params![now(), delivery_id],
        )
        .map_err(storage_error)?;

        QUEUE_ACKED.with_label_values(&[routing_key.as_str()]).inc();
        Ok(())
    }

    fn nack(&self, delivery_id: i64) -> Result<(), QueueError> {
        let conn = self.conn()?;

        let updated = conn
            .execute(
                "UPDATE messages SET delivered_at = NULL, consumer = NULL WHERE id = ? AND delivered_at IS NOT NULL AND acked_at IS NULL",
                params![delivery_id],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(QueueError::UnknownDelivery(delivery_id));
        }
        Ok(())
    }

    fn requeue_expired(&self, visibility_timeout: Duration) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        let cutoff = cutoff(visibility_timeout)?;

        conn.execute(
            "UPDATE messages SET delivered_at = NULL, consumer = NULL WHERE acked_at IS NULL AND delivered_at IS NOT NULL AND delivered_at <= ?",
            params![cutoff],
        )
        .map_err(storage_error)
    }

    fn purge_acked(&self, retention: Duration) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        let cutoff = cutoff(retention)?;

        let purged = conn
            .execute(
                "DELETE FROM messages WHERE acked_at IS NOT NULL AND acked_at <= ?",
                params![cutoff],
            )
            .map_err(storage_error)?;
        if purged > 0 {
            debug!(count = purged, "Purged acknowledged messages");
        }
        Ok(purged)
    }

    fn pending_count(&self, routing_key: RoutingKey) -> Result<i64, QueueError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE routing_key = ? AND acked_at IS NULL",
            params![routing_key.as_str()],
            |row| row.get(0),
        )
        .map_err(storage_error)
    }
}

/// Fixed-width UTC timestamps, so string comparison orders them.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Timestamp `age` before now, in the same format as [`now`].
fn cutoff(age: Duration) -> Result<String, QueueError> {
    let age = chrono::Duration::from_std(age).map_err(|e| QueueError::Storage(e.to_string()))?;
    Ok((Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn storage_error(e: rusqlite::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}
