//! UI Hub - Connected Viewer Management
//!
//! Tracks the UI viewers currently connected to the process and pushes
//! fragments and stream notifications to them. The web layer registers a
//! viewer per connection and drains its receiver onto the wire.
//!
//! # Architecture
//!
//! ```text
//!                         UiHub
//!             ┌───────────────────────────────────┐
//!             │ HashMap<ViewerId, ViewerHandle>   │
//!             │   - wrapped in Arc<RwLock<>>      │
//!             └────────────────┬──────────────────┘
//!                              │ try_send
//!          ┌───────────────────┼───────────────────┐
//!   ┌──────▼──────┐     ┌──────▼──────┐     ┌──────▼──────┐
//!   │  viewer-1   │     │  viewer-2   │     │  viewer-3   │
//!   │ topic: A    │     │ topic: all  │     │ topic: B    │
//!   └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Sends never wait: a viewer whose channel is full misses the message,
//! a viewer whose channel is closed is removed on the next cleanup.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::{ResponseFragment, TopicId};
use crate::notifications::{Notifier, StreamNotification};

/// Identifier of one connected viewer
///
/// Unique within the hub that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerId(u64);

impl ViewerId {
    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Message pushed to a viewer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiMessage {
    /// A live fragment for a topic
    Fragment(ResponseFragment),
    /// A stream lifecycle notification
    Notification(StreamNotification),
}

impl UiMessage {
    /// Topic the message concerns
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        match self {
            Self::Fragment(fragment) => &fragment.topic,
            Self::Notification(notification) => notification.topic(),
        }
    }
}

#[derive(Debug)]
struct ViewerHandle {
    tx: mpsc::Sender<UiMessage>,
    /// `None` watches every topic
    topic: Option<TopicId>,
    connected_at: Instant,
}

impl ViewerHandle {
    fn wants(&self, message: &UiMessage) -> bool {
        match (&self.topic, message) {
            (None, _) | (_, UiMessage::Notification(_)) => true,
            (Some(topic), message) => topic == message.topic(),
        }
    }
}

/// Result of pushing one message to the viewers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubBroadcastResult {
    /// Viewers that received the message
    pub successful: usize,
    /// Viewers that could not take it
    pub failed: usize,
    /// Which viewers failed
    pub failed_ids: Vec<ViewerId>,
}

impl HubBroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Registry of connected UI viewers
///
/// Cheap to clone; clones share the same viewers.
#[derive(Clone, Default)]
pub struct UiHub {
    viewers: Arc<RwLock<HashMap<ViewerId, ViewerHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl UiHub {
    /// Create a hub with no viewers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a viewer watching every topic
    ///
    /// Returns its id and the receiver the web layer drains.
    pub fn connect(&self, capacity: usize) -> (ViewerId, mpsc::Receiver<UiMessage>) {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.viewers.write().insert(
            id,
            ViewerHandle {
                tx,
                topic: None,
                connected_at: Instant::now(),
            },
        );
        tracing::info!(viewer = %id, "Viewer connected");
        (id, rx)
    }

    /// Restrict a viewer to one topic, or `None` for all topics
    ///
    /// Returns false for an unknown viewer.
    pub fn watch(&self, id: ViewerId, topic: Option<TopicId>) -> bool {
        match self.viewers.write().get_mut(&id) {
            Some(handle) => {
                tracing::debug!(viewer = %id, topic = ?topic, "Viewer watching");
                handle.topic = topic;
                true
            }
            None => {
                tracing::warn!(viewer = %id, "Attempted to watch from unknown viewer");
                false
            }
        }
    }

    /// Disconnect a viewer
    pub fn disconnect(&self, id: ViewerId) -> bool {
        let removed = self.viewers.write().remove(&id).is_some();
        if removed {
            tracing::info!(viewer = %id, "Viewer disconnected");
        }
        removed
    }

    /// Number of connected viewers
    #[must_use]
    pub fn count(&self) -> usize {
        self.viewers.read().len()
    }

    /// How long a viewer has been connected, in seconds
    #[must_use]
    pub fn uptime_secs(&self, id: ViewerId) -> Option<u64> {
        self.viewers
            .read()
            .get(&id)
            .map(|handle| handle.connected_at.elapsed().as_secs())
    }

    /// Push a message to every viewer interested in it
    ///
    /// Uses `try_send` to avoid blocking on slow viewers.
    #[must_use]
    pub fn broadcast(&self, message: &UiMessage) -> HubBroadcastResult {
        let viewers = self.viewers.read();
        let mut result = HubBroadcastResult::default();

        for (id, handle) in viewers.iter().filter(|(_, handle)| handle.wants(message)) {
            if handle.tx.try_send(message.clone()).is_ok() {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(*id);
            }
        }

        result
    }

    /// Push a fragment to the viewers of its topic
    #[must_use]
    pub fn publish_fragment(&self, fragment: ResponseFragment) -> HubBroadcastResult {
        self.broadcast(&UiMessage::Fragment(fragment))
    }

    /// Remove viewers whose receiver is gone
    ///
    /// Returns the number removed.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut viewers = self.viewers.write();
        let before = viewers.len();
        viewers.retain(|id, handle| {
            let open = !handle.tx.is_closed();
            if !open {
                tracing::debug!(viewer = %id, "Removing disconnected viewer");
            }
            open
        });
        before - viewers.len()
    }
}

impl fmt::Debug for UiHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiHub")
            .field("viewers", &self.count())
            .finish()
    }
}

impl Notifier for UiHub {
    fn notify(&self, notification: StreamNotification) {
        let result = self.broadcast(&UiMessage::Notification(notification));
        if !result.all_succeeded() {
            tracing::debug!(failed = result.failed, "Notification missed by some viewers");
        }
    }
}
