//! Worker that deletes export directories on request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{Export, ExportError};
use crate::queue::{MessageQueue, QueueError, RoutingKey};

#[derive(Debug, Error)]
pub enum WiperError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),
}

/// Consumes `export-wipe` messages, removes the job's export directory,
/// acknowledges the message and publishes `wipe-confirm`.
pub struct Wiper {
    queue: Arc<dyn MessageQueue>,
    export_dir: PathBuf,
    consumer: String,
    poll_interval: Duration,
    visibility_timeout: Duration,
    acked_retention: Duration,
}

impl Wiper {
    pub fn new(queue: Arc<dyn MessageQueue>, export_dir: PathBuf) -> Self {
        Self {
            queue,
            export_dir,
            consumer: format!("wiper-{}", uuid::Uuid::new_v4()),
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(3600),
            acked_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// How long acknowledged messages are kept before the loop purges them.
    pub fn with_acked_retention(mut self, acked_retention: Duration) -> Self {
        self.acked_retention = acked_retention;
        self
    }

    /// Requeue expired deliveries and purge old acknowledged messages.
    pub fn maintain_queue(&self) {
        match self.queue.requeue_expired(self.visibility_timeout) {
            Ok(0) => {}
            Ok(n) => debug!(count = n, "Requeued expired deliveries"),
            Err(e) => warn!("Failed to requeue expired deliveries: {}", e),
        }
        if let Err(e) = self.queue.purge_acked(self.acked_retention) {
            warn!("Failed to purge acknowledged messages: {}", e);
        }
    }

    /// Handle at most one message. Returns whether a message was received.
    pub async fn handle_next(&self) -> Result<bool, WiperError> {
        let Some(delivery) = self.queue.receive(RoutingKey::ExportWipe, &self.consumer)? else {
            return Ok(false);
        };

        info!(delivery_id = delivery.id, body = %delivery.body, "Processing wipe message");

        let Some(job_id) = delivery.body.get("job_id").and_then(|v| v.as_i64()) else {
            // Redelivering a malformed message would never succeed.
            error!(delivery_id = delivery.id, body = %delivery.body, "Wipe message has no job_id, dropping it");
            self.queue.ack(delivery.id)?;
            return Ok(true);
        };

        let export = Export::new(&self.export_dir, job_id);
        if let Err(e) = export.remove().await {
            warn!(job_id, error = %e, "Failed to remove export, returning message to the queue");
            self.queue.nack(delivery.id)?;
            return Err(e.into());
        }
        info!(job_id, directory = ?export.directory(), "Removed exports");

        self.queue.ack(delivery.id)?;
        self.queue
            .publish(RoutingKey::WipeConfirm, &json!({ "job_id": job_id }))?;

        Ok(true)
    }

    /// Consume until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(consumer = %self.consumer, "Wiper started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Wiper received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.maintain_queue();

                    loop {
                        match self.handle_next().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(e) => {
                                error!("Wipe failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("Wiper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteMessageQueue;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SqliteMessageQueue>, Wiper) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SqliteMessageQueue::in_memory().unwrap());
        let wiper = Wiper::new(
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            dir.path().to_path_buf(),
        );
        (dir, queue, wiper)
    }

    #[tokio::test]
    async fn test_wipe_removes_directory_and_confirms() {
        let (dir, queue, wiper) = setup();
        let export_dir = dir.path().join("12");
        std::fs::create_dir_all(&export_dir).unwrap();
        std::fs::write(export_dir.join("full.jsonl.gz"), b"").unwrap();

        queue
            .publish(RoutingKey::ExportWipe, &json!({"job_id": 12}))
            .unwrap();

        assert!(wiper.handle_next().await.unwrap());
        assert!(!export_dir.exists());
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);

        let confirm = queue
            .receive(RoutingKey::WipeConfirm, "test")
            .unwrap()
            .unwrap();
        assert_eq!(confirm.body["job_id"], 12);
    }

    #[tokio::test]
    async fn test_wipe_missing_directory_still_acks() {
        let (_dir, queue, wiper) = setup();
        queue
            .publish(RoutingKey::ExportWipe, &json!({"job_id": 99}))
            .unwrap();

        assert!(wiper.handle_next().await.unwrap());
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (_dir, queue, wiper) = setup();
        queue
            .publish(RoutingKey::ExportWipe, &json!({"spider": "x"}))
            .unwrap();

        assert!(wiper.handle_next().await.unwrap());
        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);
        assert_eq!(queue.pending_count(RoutingKey::WipeConfirm).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_purges_settled_messages() {
        let (_dir, queue, wiper) = setup();
        let wiper = wiper.with_acked_retention(Duration::ZERO);
        queue
            .publish(RoutingKey::ExportWipe, &json!({"job_id": 99}))
            .unwrap();
        assert!(wiper.handle_next().await.unwrap());

        wiper.maintain_queue();

        // The wipe message is gone; the unconsumed confirmation stays.
        assert_eq!(queue.purge_acked(Duration::ZERO).unwrap(), 0);
        assert_eq!(queue.pending_count(RoutingKey::WipeConfirm).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_dir, _queue, wiper) = setup();
        assert!(!wiper.handle_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, queue, wiper) = setup();
        let wiper = wiper.with_poll_interval(Duration::from_millis(10));
        queue
            .publish(RoutingKey::ExportWipe, &json!({"job_id": 1}))
            .unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { wiper.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.pending_count(RoutingKey::ExportWipe).unwrap(), 0);
    }
}
