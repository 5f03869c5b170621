//! Pub/sub notification substrate: an in-process broadcast channel for
//! connected workers, backed by a durable pending-notification table for
//! workers that are not currently listening (SPEC_FULL §4.2/§6).
//!
//! A single active coordinator process owns the broadcast channel, so no
//! distributed pub/sub is needed -- the durable table exists purely to
//! bridge the gap between "event fired" and "worker next polls".

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;

use coordinator_db::queries::notifications as notify_db;

/// An event delivered to a worker about one of its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Broadcast registry: every subscriber receives every event and filters by
/// `agent_id` itself, the same fan-out-then-filter shape as a Redis pub/sub
/// channel shared by all workers.
pub struct Notifier {
    sender: broadcast::Sender<(String, TaskEvent)>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, TaskEvent)> {
        self.sender.subscribe()
    }

    /// Publish to the in-process channel and, durably, to the pending
    /// table so a disconnected worker still sees the event on its next
    /// heartbeat/poll.
    pub async fn publish(
        &self,
        pool: &PgPool,
        agent_id: &str,
        event: TaskEvent,
    ) -> anyhow::Result<()> {
        notify_db::push_pending(pool, agent_id, &event.task_id, &event.event_type, event.data.clone())
            .await?;
        // No subscribers is not an error -- the durable row is the fallback.
        let _ = self.sender.send((agent_id.to_string(), event));
        Ok(())
    }

    /// Drain and clear every pending notification for a worker, the
    /// fallback path used on heartbeat.
    pub async fn drain_pending(&self, pool: &PgPool, agent_id: &str) -> anyhow::Result<Vec<TaskEvent>> {
        let rows = notify_db::list_pending(pool, agent_id).await?;
        let events = rows
            .iter()
            .map(|r| TaskEvent {
                task_id: r.task_id.clone(),
                event_type: r.event_type.clone(),
                data: r.data.clone(),
            })
            .collect();
        notify_db::clear_all_pending(pool, agent_id).await?;
        Ok(events)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
