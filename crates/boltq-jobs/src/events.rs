//! Status-transition events broadcast on the pub/sub channels.
//!
//! Events are fire-and-forget: the API collaborator fans them out to
//! WebSocket subscribers, but the `task:{id}` status record remains the
//! source of truth. A lost event is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Kind of transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A job changed status.
    JobUpdate,
    /// A workflow (or one of its steps) changed status.
    WorkflowUpdate,
}

/// A single status-transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Transition kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Job or workflow ID.
    pub id: String,
    /// New status, lowercase wire name.
    pub status: String,
    /// Optional context (e.g. step ID and status for workflow events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// When the transition was recorded.
    pub ts: DateTime<Utc>,
}

impl QueueEvent {
    /// Event for a job status transition.
    pub fn job_update<S: Into<String>>(id: S, status: S) -> Self {
        Self {
            kind: EventKind::JobUpdate,
            id: id.into(),
            status: status.into(),
            data: None,
            ts: Utc::now(),
        }
    }

    /// Event for a workflow transition.
    pub fn workflow_update<S: Into<String>>(id: S, status: S) -> Self {
        Self {
            kind: EventKind::WorkflowUpdate,
            id: id.into(),
            status: status.into(),
            data: None,
            ts: Utc::now(),
        }
    }

    /// Attach context to the event.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Typed view over a raw pub/sub subscription.
pub struct EventStream {
    rx: mpsc::Receiver<String>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next decodable event, or `None` once the subscription closes.
    ///
    /// Payloads that fail to decode are skipped; foreign publishers on the
    /// same channel must not wedge the stream.
    pub async fn next(&mut self) -> Option<QueueEvent> {
        while let Some(raw) = self.rx.recv().await {
            match serde_json::from_str(&raw) {
                Ok(event) => return Some(event),
                Err(err) => {
                    debug!(error = %err, "skipping undecodable event payload");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format() {
        let event = QueueEvent::job_update("abc", "completed");
        let raw = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["type"], "job_update");
        assert_eq!(value["id"], "abc");
        assert_eq!(value["status"], "completed");
        assert!(value.get("data").is_none());
    }

    #[tokio::test]
    async fn stream_skips_garbage_payloads() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = EventStream::new(rx);

        tx.send("not json".to_string()).await.unwrap();
        let event = QueueEvent::workflow_update("wf", "running");
        tx.send(serde_json::to_string(&event).unwrap()).await.unwrap();
        drop(tx);

        let got = stream.next().await.unwrap();
        assert_eq!(got.kind, EventKind::WorkflowUpdate);
        assert_eq!(got.id, "wf");
        assert!(stream.next().await.is_none());
    }
}
