//! Message queue types and trait.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Direct routing keys understood by the export workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingKey {
    ExportStart,
    ExportWipe,
    FlattenStart,
    WipeConfirm,
}

impl RoutingKey {
    pub const ALL: [RoutingKey; 4] = [
        RoutingKey::ExportStart,
        RoutingKey::ExportWipe,
        RoutingKey::FlattenStart,
        RoutingKey::WipeConfirm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::ExportStart => "export-start",
            RoutingKey::ExportWipe => "export-wipe",
            RoutingKey::FlattenStart => "flatten-start",
            RoutingKey::WipeConfirm => "wipe-confirm",
        }
    }
}

impl FromStr for RoutingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export-start" => Ok(RoutingKey::ExportStart),
            "export-wipe" => Ok(RoutingKey::ExportWipe),
            "flatten-start" => Ok(RoutingKey::FlattenStart),
            "wipe-confirm" => Ok(RoutingKey::WipeConfirm),
            other => Err(format!("unknown routing key: {}", other)),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message handed to a consumer. It stays in flight until acked or nacked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub routing_key: RoutingKey,
    pub body: Value,
    /// Number of times the message has been handed out, including this one.
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown or already settled delivery: {0}")]
    UnknownDelivery(i64),

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("queue storage error: {0}")]
    Storage(String),
}

/// A durable at-least-once queue with direct routing.
///
/// Each consumer holds at most one unacknowledged delivery per routing key.
pub trait MessageQueue: Send + Sync {
    /// Publish a JSON message. Returns the message ID.
    fn publish(&self, routing_key: RoutingKey, body: &Value) -> Result<i64, QueueError>;

    /// Claim the oldest ready message for `routing_key`, if the consumer has none in flight.
    fn receive(&self, routing_key: RoutingKey, consumer: &str)
        -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery after its work was durably completed.
    fn ack(&self, delivery_id: i64) -> Result<(), QueueError>;

    /// Return a delivery to the queue for redelivery.
    fn nack(&self, delivery_id: i64) -> Result<(), QueueError>;

    /// Return deliveries unacked for longer than `visibility_timeout` to the queue.
    fn requeue_expired(&self, visibility_timeout: Duration) -> Result<usize, QueueError>;

    /// Delete messages acknowledged more than `retention` ago.
    fn purge_acked(&self, retention: Duration) -> Result<usize, QueueError>;

    /// Messages not yet acknowledged for `routing_key`.
    fn pending_count(&self, routing_key: RoutingKey) -> Result<i64, QueueError>;
}
