//! EventBus - broadcast notifications for job and task progress.
//!
//! Events exist for UI visibility only. Consumers must tolerate missed and
//! duplicate events; nothing in the engine depends on their delivery.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::execution::ExecutionStatus;

/// Notifications emitted by the scheduler and the execution engine.
///
/// Payloads carry identifiers and short messages only. Full records are
/// fetched from the stores by id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A worker started running a job
    JobStarted {
        /// Job definition
        job_id: Uuid,
        /// Owner
        user_id: Uuid,
        /// Queue item being processed
        queued_job_id: Uuid,
        /// Run history row
        run_id: Uuid,
    },
    /// A job run finished
    JobCompleted {
        /// Job definition
        job_id: Uuid,
        /// Owner
        user_id: Uuid,
        /// Whether the handler succeeded
        success: bool,
        /// Wall time of the run
        duration_ms: u64,
        /// Failure description
        error: Option<String>,
    },
    /// A task execution changed state
    TaskStatus {
        /// Execution
        execution_id: Uuid,
        /// Task template
        task_id: Uuid,
        /// Owner
        user_id: Uuid,
        /// New state
        status: ExecutionStatus,
        /// Action text or error message
        message: Option<String>,
    },
}

impl EngineEvent {
    /// Channel-style name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job:started",
            Self::JobCompleted { .. } => "job:completed",
            Self::TaskStatus { .. } => "task:status",
        }
    }

    /// User the event is addressed to
    #[must_use]
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::JobStarted { user_id, .. }
            | Self::JobCompleted { user_id, .. }
            | Self::TaskStatus { user_id, .. } => *user_id,
        }
    }
}

/// Broadcast-based event bus.
///
/// Slow subscribers lag and miss events rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: EngineEvent) -> usize {
        // No receivers is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let user = Uuid::new_v4();

        bus.publish(EngineEvent::JobCompleted {
            job_id: Uuid::new_v4(),
            user_id: user,
            success: true,
            duration_ms: 12,
            error: None,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "job:completed");
        assert_eq!(event.user_id(), user);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        let delivered = bus.publish(EngineEvent::TaskStatus {
            execution_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: ExecutionStatus::Done,
            message: None,
        });
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = EngineEvent::TaskStatus {
            execution_id: Uuid::nil(),
            task_id: Uuid::nil(),
            user_id: Uuid::nil(),
            status: ExecutionStatus::ManualRequired,
            message: Some("sign it".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_status");
        assert_eq!(json["status"], "MANUAL_REQUIRED");
    }
}
