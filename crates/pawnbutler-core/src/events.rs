// Pawnbutler Core — Engine event stream
// Typed publish/subscribe for UI-facing consumers (badges, panels, status
// lines). Retention is bounded: the newest 200 events are kept for late
// subscribers, older ones are dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::atoms::constants::EVENT_STREAM_CAPACITY;
use crate::atoms::types::{ApprovalStatus, SafetyLevel};

// ── Event payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Started,
    Stopped,
    ActionChecked {
        request_id: String,
        agent_id: String,
        action_type: String,
        safety_level: SafetyLevel,
    },
    ActionBlocked {
        request_id: String,
        agent_id: String,
        action_type: String,
        reason: String,
    },
    ApprovalRequested {
        request_id: String,
        agent_id: String,
        action_type: String,
    },
    ApprovalResolved {
        request_id: String,
        status: ApprovalStatus,
        reviewed_by: String,
    },
    TaskTriggered {
        job_id: String,
        job_name: String,
        target_agent: String,
    },
}

// ── EventStream ────────────────────────────────────────────────────────

/// Bounded fan-out of engine events. `recent()` replays what a consumer
/// missed; `subscribe()` delivers everything from now on.
pub struct EventStream {
    sender: broadcast::Sender<EngineEvent>,
    recent: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_STREAM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventStream {
            sender,
            recent: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Publish an event. Never fails: with no subscribers the event still
    /// lands in the recent ring.
    pub fn publish(&self, event: EngineEvent) {
        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained ring, oldest first.
    pub fn recent(&self) -> Vec<EngineEvent> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_receive() {
        let stream = EventStream::new();
        let mut rx = stream.subscribe();
        stream.publish(EngineEvent::Started);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::Started));
    }

    #[test]
    fn test_recent_ring_bounded() {
        let stream = EventStream::with_capacity(3);
        for i in 0..5 {
            stream.publish(EngineEvent::TaskTriggered {
                job_id: format!("j{}", i),
                job_name: "tick".into(),
                target_agent: "butler".into(),
            });
        }
        let recent = stream.recent();
        assert_eq!(recent.len(), 3);
        match &recent[0] {
            EngineEvent::TaskTriggered { job_id, .. } => assert_eq!(job_id, "j2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let stream = EventStream::new();
        stream.publish(EngineEvent::Stopped);
        assert_eq!(stream.recent().len(), 1);
    }
}
