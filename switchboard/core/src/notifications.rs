//! Stream Notifications
//!
//! Events the core emits toward whatever UI-push mechanism is wired in.
//! The core only produces these; delivering them over a wire is somebody
//! else's job.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::messages::TopicId;

/// Lifecycle events for a topic's stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamNotification {
    /// A producer started streaming into the topic
    StreamStarted {
        /// Topic that started
        topic: TopicId,
    },
    /// The producer finished every queued prompt
    StreamCompleted {
        /// Topic that completed
        topic: TopicId,
    },
    /// The stream was cancelled before completing
    StreamCancelled {
        /// Topic that was cancelled
        topic: TopicId,
    },
    /// A new message landed in the topic
    NewMessage {
        /// Topic with the new message
        topic: TopicId,
    },
}

impl StreamNotification {
    /// Topic this notification is about
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        match self {
            Self::StreamStarted { topic }
            | Self::StreamCompleted { topic }
            | Self::StreamCancelled { topic }
            | Self::NewMessage { topic } => topic,
        }
    }
}

/// Sink for stream notifications
///
/// Implementations must not block: notifications are emitted from inside
/// per-topic bookkeeping paths.
pub trait Notifier: Send + Sync {
    /// Publish a notification
    fn notify(&self, notification: StreamNotification);
}

/// Notifier that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: StreamNotification) {}
}

/// Fan-out notifier backed by a tokio broadcast channel
///
/// Slow subscribers lag and lose the oldest notifications rather than
/// holding up the core.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<StreamNotification>,
}

impl BroadcastNotifier {
    /// Create a notifier retaining up to `capacity` undelivered notifications per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamNotification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: StreamNotification) {
        // No receivers is normal when no UI is attached.
        if self.tx.send(notification).is_err() {
            tracing::trace!("Notification dropped, no subscribers");
        }
    }
}
