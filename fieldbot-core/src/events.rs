// ABOUTME: In-process live-update channel for presentation layers (WebSocket, dashboards).
// ABOUTME: Typed LiveEvent payloads fanned out over a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::status::StatusSnapshot;

/// Events published to live observers. Serialized with a `type` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LiveEvent {
    #[serde(rename = "connection.state")]
    ConnectionState { data: ConnectionStateData },
    #[serde(rename = "job.claimed")]
    JobClaimed { data: JobEventData },
    #[serde(rename = "job.started")]
    JobStarted { data: JobEventData },
    #[serde(rename = "job.completed")]
    JobCompleted { data: JobEventData },
    #[serde(rename = "status.snapshot")]
    StatusSnapshot { data: StatusSnapshot },
}

impl LiveEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionState { .. } => "connection.state",
            Self::JobClaimed { .. } => "job.claimed",
            Self::JobStarted { .. } => "job.started",
            Self::JobCompleted { .. } => "job.completed",
            Self::StatusSnapshot { .. } => "status.snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateData {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEventData {
    pub job_number: String,
    pub title: String,
    pub technician_id: i64,
    pub technician_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
}

/// Fan-out hub; cheap to clone
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<LiveEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: LiveEvent) {
        tracing::trace!(event_type = event.event_type(), "Publishing live event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
