//! Tracker events and the process-wide event bus
//!
//! Every lifecycle change recorded by the tracker becomes a [`TrackEvent`].
//! Events reach two kinds of listener:
//!
//! - per-task subscriptions (see `PublishTrackerService::subscribe`), which
//!   only see one task and are closed when that task finishes;
//! - the [`EventBus`], a `tokio::sync::broadcast` channel carrying every
//!   event, used by the daemon to stream progress.
//!
//! # Non-Blocking Behavior
//!
//! If no subscribers exist, events are dropped immediately. Lagging
//! broadcast subscribers miss the oldest events rather than blocking the
//! publisher.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::TaskStatus;

/// Event receiver type alias
pub type EventReceiver = broadcast::Receiver<TrackEvent>;

/// Broadcast channel for tracker events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging subscribers
    /// start losing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers without blocking
    pub fn emit(&self, event: TrackEvent) {
        // send() only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Lifecycle events for a task and its platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackEvent {
    /// Delivery to a platform started
    Started {
        task_id: String,
        platform: String,
        title: String,
    },

    /// Delivery to a platform succeeded
    Succeeded {
        task_id: String,
        platform: String,
        duration_ms: u64,
        result: Value,
    },

    /// Delivery to a platform failed
    Failed {
        task_id: String,
        platform: String,
        duration_ms: u64,
        error: String,
    },

    /// A failed platform will be tried again
    Retrying {
        task_id: String,
        platform: String,
        retry_count: u32,
    },

    /// The task left the queue for good
    Finished { task_id: String, status: TaskStatus },
}

impl TrackEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TrackEvent::Started { task_id, .. }
            | TrackEvent::Succeeded { task_id, .. }
            | TrackEvent::Failed { task_id, .. }
            | TrackEvent::Retrying { task_id, .. }
            | TrackEvent::Finished { task_id, .. } => task_id,
        }
    }

    pub fn platform(&self) -> Option<&str> {
        match self {
            TrackEvent::Started { platform, .. }
            | TrackEvent::Succeeded { platform, .. }
            | TrackEvent::Failed { platform, .. }
            | TrackEvent::Retrying { platform, .. } => Some(platform),
            TrackEvent::Finished { .. } => None,
        }
    }
}
