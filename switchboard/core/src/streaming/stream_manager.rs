//! Stream Manager Implementation
//!
//! Registry of per-topic stream buffers shared by producers, sinks and
//! reconnecting viewers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stream_buffer::{
    AppendOutcome, BufferOverflowPolicy, BufferStats, StreamBuffer, StreamSnapshot,
};
use crate::messages::{ResponseFragment, SenderId, TopicId};
use crate::notifications::{NoopNotifier, Notifier, StreamNotification};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the stream manager
#[derive(Clone, Debug)]
pub struct StreamManagerConfig {
    /// Maximum fragments kept per topic before applying the overflow policy
    pub max_fragments: usize,
    /// How to handle a full buffer
    pub overflow_policy: BufferOverflowPolicy,
    /// Idle time after which a buffer without a producer is swept
    pub orphan_grace: Duration,
    /// Silence after which a buffer whose producer is still flagged active is swept
    pub stalled_producer: Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            max_fragments: 10_000,
            overflow_policy: BufferOverflowPolicy::DropOldest,
            orphan_grace: Duration::from_secs(30),
            stalled_producer: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Live Events
// ============================================================================

/// Event delivered to a live subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LiveEvent {
    /// A fragment was appended (already sequenced)
    Fragment(ResponseFragment),
    /// The producer completed
    Completed,
    /// The stream was cancelled
    Cancelled,
}

/// Live feed of one topic's buffer
///
/// Ends after [`LiveEvent::Completed`] / [`LiveEvent::Cancelled`], or when
/// the buffer is cleaned up.
#[derive(Debug)]
pub struct LiveSubscription {
    topic: TopicId,
    rx: mpsc::UnboundedReceiver<LiveEvent>,
}

impl LiveSubscription {
    /// Topic this subscription follows
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Wait for the next event; `None` once the feed has ended
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream`
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<LiveEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

// ============================================================================
// Per-topic State
// ============================================================================

#[derive(Debug)]
struct TopicState {
    buffer: StreamBuffer,
    subscribers: Vec<mpsc::UnboundedSender<LiveEvent>>,
    /// Removed from the registry; every operation through a stale handle is a no-op
    retired: bool,
}

impl TopicState {
    fn publish(&mut self, event: &LiveEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Complete the buffer and end every subscription
    fn finish(&mut self, event: LiveEvent) -> bool {
        let first = self.buffer.mark_completed();
        if first {
            self.publish(&event);
            self.subscribers.clear();
        }
        first
    }
}

#[derive(Debug)]
struct TopicStream {
    state: Mutex<TopicState>,
}

impl TopicStream {
    fn new(topic: TopicId, name: &str, sender: Option<SenderId>, config: &StreamManagerConfig) -> Self {
        Self {
            state: Mutex::new(TopicState {
                buffer: StreamBuffer::new(
                    topic,
                    name,
                    sender,
                    config.max_fragments,
                    config.overflow_policy,
                ),
                subscribers: Vec::new(),
                retired: false,
            }),
        }
    }

    fn is_completed(&self) -> bool {
        self.state.lock().buffer.is_completed()
    }

    fn is_orphaned(&self, now: Instant, grace: Duration, stalled: Duration) -> bool {
        self.state.lock().buffer.is_orphaned(now, grace, stalled)
    }

    fn retire(&self) {
        let mut state = self.state.lock();
        state.retired = true;
        state.buffer.detach_producer();
        state.buffer.cancellation_token().cancel();
        state.subscribers.clear();
    }
}

/// Counters and collaborators shared by the manager and every handle
struct Shared {
    notifier: Arc<dyn Notifier>,
    total_fragments_appended: AtomicU64,
    dropped_late_writes: AtomicU64,
}

impl Shared {
    fn append(&self, stream: &TopicStream, fragment: ResponseFragment) -> AppendOutcome {
        let mut state = stream.state.lock();
        let topic = state.buffer.topic().clone();

        if state.retired {
            debug!(topic = %topic, "Append to a cleaned-up buffer ignored");
            return AppendOutcome::LateWrite;
        }

        let mut live = (!state.subscribers.is_empty()).then(|| fragment.clone());
        let outcome = state.buffer.append(fragment);

        match &outcome {
            AppendOutcome::Appended { sequence, evicted } => {
                self.total_fragments_appended.fetch_add(1, Ordering::Relaxed);
                if *evicted > 0 {
                    warn!(topic = %topic, evicted, "Buffer full, dropped oldest fragments");
                }
                debug!(topic = %topic, sequence, "Fragment appended");
                if let Some(mut live) = live.take() {
                    live.sequence = *sequence;
                    state.publish(&LiveEvent::Fragment(live));
                }
            }
            AppendOutcome::LateWrite => {
                self.dropped_late_writes.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %topic, "Dropped fragment written after completion");
            }
            AppendOutcome::OutOfOrder { last, got } => {
                error!(topic = %topic, last, got, "Dropped fragment with non-increasing sequence");
            }
            AppendOutcome::Full => {
                warn!(topic = %topic, "Buffer full, dropped newest fragment");
            }
        }

        outcome
    }

    /// `strict` reports a repeated completion as an invariant violation
    fn mark_completed(&self, stream: &TopicStream, strict: bool) -> bool {
        let (topic, first) = {
            let mut state = stream.state.lock();
            if state.retired {
                return false;
            }
            (state.buffer.topic().clone(), state.finish(LiveEvent::Completed))
        };

        if first {
            info!(topic = %topic, "Stream completed");
            self.notifier.notify(StreamNotification::StreamCompleted { topic });
        } else if strict {
            error!(topic = %topic, "Stream completed twice");
        }
        first
    }

    fn detach_producer(&self, stream: &TopicStream) {
        let mut state = stream.state.lock();
        if !state.retired && !state.buffer.is_completed() {
            warn!(topic = %state.buffer.topic(), "Producer detached without completing");
            state.buffer.detach_producer();
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Shared handle to one topic's buffer
///
/// Every handle obtained for the same topic refers to the same buffer. Once
/// the buffer is cleaned up, operations through the handle are no-ops.
#[derive(Clone)]
pub struct BufferHandle {
    topic: TopicId,
    stream: Arc<TopicStream>,
    shared: Arc<Shared>,
}

impl BufferHandle {
    /// Topic of the buffer
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Append a fragment
    pub fn append(&self, fragment: ResponseFragment) -> AppendOutcome {
        self.shared.append(&self.stream, fragment)
    }

    /// Record the prompt currently being answered
    pub fn set_current_prompt(&self, text: impl Into<String>, sender: Option<SenderId>) {
        let mut state = self.stream.state.lock();
        if !state.retired {
            state.buffer.set_current_prompt(text, sender);
        }
    }

    /// Point-in-time copy of the buffer
    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot {
        self.stream.state.lock().buffer.snapshot()
    }

    /// Whether the producer completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.stream.is_completed()
    }

    /// Cancellation handle for the producer
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.stream.state.lock().buffer.cancellation_token()
    }

    /// Whether two handles refer to the same buffer instance
    #[must_use]
    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Marks a task as the producer of a topic's stream
///
/// Call [`ProducerGuard::complete`] when the reply is done. Dropping the
/// guard without completing (panic, cancellation, early return) detaches the
/// producer so the orphan sweeper can reclaim the buffer after its grace
/// period.
#[derive(Debug)]
pub struct ProducerGuard {
    handle: BufferHandle,
    finished: bool,
}

impl ProducerGuard {
    /// Buffer being produced into
    #[must_use]
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    /// Append a fragment
    pub fn append(&self, fragment: ResponseFragment) -> AppendOutcome {
        self.handle.append(fragment)
    }

    /// Cancellation handle for this producer
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancellation_token()
    }

    /// Signal completion
    ///
    /// Returns `false` if the buffer had already been completed by someone
    /// else (e.g. a completion fragment passing through a broadcast).
    pub fn complete(mut self) -> bool {
        self.finished = true;
        self.handle.shared.mark_completed(&self.handle.stream, false)
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.shared.detach_producer(&self.handle.stream);
        }
    }
}

// ============================================================================
// Stream Manager
// ============================================================================

/// Registry of per-topic stream buffers
///
/// At most one live buffer exists per topic. All methods take `&self`; share
/// the manager behind an `Arc`.
pub struct StreamManager {
    streams: DashMap<TopicId, Arc<TopicStream>>,
    config: StreamManagerConfig,
    shared: Arc<Shared>,
    total_buffers_created: AtomicU64,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    /// Create a stream manager with default configuration and no notifier
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StreamManagerConfig::default())
    }

    /// Create a stream manager with custom configuration and no notifier
    #[must_use]
    pub fn with_config(config: StreamManagerConfig) -> Self {
        Self::with_notifier(config, Arc::new(NoopNotifier))
    }

    /// Create a stream manager that publishes lifecycle notifications
    #[must_use]
    pub fn with_notifier(config: StreamManagerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            streams: DashMap::new(),
            config,
            shared: Arc::new(Shared {
                notifier,
                total_fragments_appended: AtomicU64::new(0),
                dropped_late_writes: AtomicU64::new(0),
            }),
            total_buffers_created: AtomicU64::new(0),
        }
    }

    /// Get the current configuration
    #[must_use]
    pub fn config(&self) -> &StreamManagerConfig {
        &self.config
    }

    /// Publish a notification through the configured notifier
    pub fn notify(&self, notification: StreamNotification) {
        self.shared.notifier.notify(notification);
    }

    fn handle(&self, topic: TopicId, stream: Arc<TopicStream>) -> BufferHandle {
        BufferHandle {
            topic,
            stream,
            shared: Arc::clone(&self.shared),
        }
    }

    fn stream(&self, topic: &TopicId) -> Option<Arc<TopicStream>> {
        self.streams.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Get the topic's buffer, creating it if needed
    ///
    /// Idempotent while a buffer is live: concurrent callers for the same
    /// topic receive handles to one buffer. A buffer whose producer already
    /// completed is replaced by a fresh one.
    pub fn get_or_create(
        &self,
        topic: TopicId,
        name: &str,
        initial_sender: Option<SenderId>,
    ) -> BufferHandle {
        let (stream, created) = match self.streams.entry(topic.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_completed() {
                    let fresh = Arc::new(TopicStream::new(
                        topic.clone(),
                        name,
                        initial_sender,
                        &self.config,
                    ));
                    let previous = entry.insert(Arc::clone(&fresh));
                    previous.retire();
                    (fresh, true)
                } else {
                    (Arc::clone(entry.get()), false)
                }
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(TopicStream::new(
                    topic.clone(),
                    name,
                    initial_sender,
                    &self.config,
                ));
                entry.insert(Arc::clone(&fresh));
                (fresh, true)
            }
        };

        if created {
            self.total_buffers_created.fetch_add(1, Ordering::Relaxed);
            info!(topic = %topic, name, "Stream buffer created");
        }

        self.handle(topic, stream)
    }

    /// Handle to an existing buffer
    #[must_use]
    pub fn get(&self, topic: &TopicId) -> Option<BufferHandle> {
        self.stream(topic).map(|stream| self.handle(topic.clone(), stream))
    }

    /// Whether the topic has a buffer
    #[must_use]
    pub fn contains(&self, topic: &TopicId) -> bool {
        self.streams.contains_key(topic)
    }

    /// Claim the producer role for a topic
    ///
    /// Returns `None` if there is no buffer or it already completed.
    #[must_use]
    pub fn begin_producing(&self, topic: &TopicId) -> Option<ProducerGuard> {
        let stream = self.stream(topic)?;
        {
            let mut state = stream.state.lock();
            if state.retired || !state.buffer.attach_producer() {
                return None;
            }
        }
        debug!(topic = %topic, "Producer attached");
        Some(ProducerGuard {
            handle: self.handle(topic.clone(), stream),
            finished: false,
        })
    }

    /// Remove the topic's buffer and release its cancellation handle
    ///
    /// Live subscriptions end. Returns whether a buffer was removed.
    pub fn cleanup(&self, topic: &TopicId) -> bool {
        match self.streams.remove(topic) {
            Some((_, stream)) => {
                stream.retire();
                info!(topic = %topic, "Stream buffer cleaned up");
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Producer Operations
    // ------------------------------------------------------------------------

    /// Append a fragment; returns whether it was stored
    ///
    /// No-op if the topic has no buffer.
    pub fn append(&self, topic: &TopicId, fragment: ResponseFragment) -> bool {
        match self.stream(topic) {
            Some(stream) => self.shared.append(&stream, fragment).is_appended(),
            None => {
                debug!(topic = %topic, "Append without buffer ignored");
                false
            }
        }
    }

    /// Record the prompt currently being answered; returns whether a buffer exists
    pub fn set_current_prompt(
        &self,
        topic: &TopicId,
        text: impl Into<String>,
        sender: Option<SenderId>,
    ) -> bool {
        match self.get(topic) {
            Some(handle) => {
                handle.set_current_prompt(text, sender);
                true
            }
            None => false,
        }
    }

    /// Count one more queued prompt; returns whether a buffer existed
    pub fn try_increment_pending(&self, topic: &TopicId) -> bool {
        let Some(stream) = self.stream(topic) else {
            return false;
        };
        let mut state = stream.state.lock();
        if state.retired {
            return false;
        }
        let pending = state.buffer.increment_pending();
        debug!(topic = %topic, pending, "Prompt queued");
        true
    }

    /// Count one answered prompt, completing the buffer when none remain
    ///
    /// Returns the remaining pending count, or `None` if there is no buffer.
    pub fn complete_prompt(&self, topic: &TopicId) -> Option<u32> {
        let stream = self.stream(topic)?;
        let (remaining, completed) = {
            let mut state = stream.state.lock();
            if state.retired {
                return None;
            }
            let remaining = match state.buffer.decrement_pending() {
                Some(remaining) => remaining,
                None => {
                    error!(topic = %topic, "Pending prompt count underflow");
                    0
                }
            };
            let completed = remaining == 0 && state.finish(LiveEvent::Completed);
            (remaining, completed)
        };

        if completed {
            info!(topic = %topic, "Stream completed");
            self.notify(StreamNotification::StreamCompleted {
                topic: topic.clone(),
            });
        }
        Some(remaining)
    }

    /// Mark the producer as finished; returns whether this call completed it
    ///
    /// Later appends are dropped. Completing twice is logged as an error.
    pub fn mark_completed(&self, topic: &TopicId) -> bool {
        self.stream(topic)
            .is_some_and(|stream| self.shared.mark_completed(&stream, true))
    }

    /// Flag the producer as gone without completing
    pub fn detach_producer(&self, topic: &TopicId) {
        if let Some(stream) = self.stream(topic) {
            self.shared.detach_producer(&stream);
        }
    }

    /// Cancel the topic's stream
    ///
    /// Fires the cancellation handle, completes the buffer and tells live
    /// subscribers. Returns `false` if there is nothing running to cancel.
    pub fn cancel(&self, topic: &TopicId) -> bool {
        let Some(stream) = self.stream(topic) else {
            return false;
        };
        let cancelled = {
            let mut state = stream.state.lock();
            if state.retired {
                return false;
            }
            state.buffer.cancellation_token().cancel();
            state.finish(LiveEvent::Cancelled)
        };

        if cancelled {
            info!(topic = %topic, "Stream cancelled");
            self.notify(StreamNotification::StreamCancelled {
                topic: topic.clone(),
            });
        }
        cancelled
    }

    /// Cancellation handle of the topic's producer
    #[must_use]
    pub fn cancellation_token(&self, topic: &TopicId) -> Option<CancellationToken> {
        self.get(topic).map(|handle| handle.cancellation_token())
    }

    // ------------------------------------------------------------------------
    // Viewer Operations
    // ------------------------------------------------------------------------

    /// Point-in-time copy of the topic's buffer
    #[must_use]
    pub fn snapshot(&self, topic: &TopicId) -> Option<StreamSnapshot> {
        let stream = self.stream(topic)?;
        let state = stream.state.lock();
        (!state.retired).then(|| state.buffer.snapshot())
    }

    /// Snapshot the buffer and subscribe to everything appended after it
    ///
    /// Both happen under the buffer's lock, so no fragment is missed or seen
    /// twice. For a completed buffer the subscription is already closed.
    #[must_use]
    pub fn snapshot_and_subscribe(
        &self,
        topic: &TopicId,
    ) -> Option<(StreamSnapshot, LiveSubscription)> {
        let stream = self.stream(topic)?;
        let mut state = stream.state.lock();
        if state.retired {
            return None;
        }

        let snapshot = state.buffer.snapshot();
        let (tx, rx) = mpsc::unbounded_channel();
        if !snapshot.completed {
            state.subscribers.push(tx);
        }

        Some((
            snapshot,
            LiveSubscription {
                topic: topic.clone(),
                rx,
            },
        ))
    }

    // ------------------------------------------------------------------------
    // Orphan Sweeping
    // ------------------------------------------------------------------------

    /// Remove buffers whose producer is gone
    ///
    /// Returns the number of buffers removed.
    pub fn sweep_orphans(&self) -> usize {
        let now = Instant::now();
        let grace = self.config.orphan_grace;
        let stalled = self.config.stalled_producer;

        let candidates: Vec<TopicId> = self
            .streams
            .iter()
            .filter(|entry| entry.value().is_orphaned(now, grace, stalled))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for topic in candidates {
            if let Some((_, stream)) = self
                .streams
                .remove_if(&topic, |_, stream| stream.is_orphaned(now, grace, stalled))
            {
                stream.retire();
                removed += 1;
                info!(topic = %topic, "Orphaned stream buffer swept");
            }
        }
        removed
    }

    /// Run [`StreamManager::sweep_orphans`] periodically until `cancel` fires
    pub fn spawn_orphan_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Orphan sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = manager.sweep_orphans();
                        if removed > 0 {
                            debug!(removed, remaining = manager.active_count(), "Orphan sweep finished");
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Number of buffers currently registered
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether no buffers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Topics that currently have a buffer
    #[must_use]
    pub fn active_topics(&self) -> Vec<TopicId> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Statistics for one buffer
    #[must_use]
    pub fn buffer_stats(&self, topic: &TopicId) -> Option<BufferStats> {
        self.stream(topic)
            .map(|stream| stream.state.lock().buffer.stats().clone())
    }

    /// Buffers created (lifetime)
    #[must_use]
    pub fn total_buffers_created(&self) -> u64 {
        self.total_buffers_created.load(Ordering::Relaxed)
    }

    /// Fragments stored (lifetime)
    #[must_use]
    pub fn total_fragments_appended(&self) -> u64 {
        self.shared.total_fragments_appended.load(Ordering::Relaxed)
    }

    /// Fragments dropped because they arrived after completion (lifetime)
    #[must_use]
    pub fn dropped_late_writes(&self) -> u64 {
        self.shared.dropped_late_writes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("active_count", &self.active_count())
            .field("total_buffers_created", &self.total_buffers_created())
            .field("total_fragments_appended", &self.total_fragments_appended())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageId;
    use crate::notifications::BroadcastNotifier;
    use pretty_assertions::assert_eq;
    use tokio::task::JoinSet;

    fn topic() -> TopicId {
        TopicId::from("agent/chat")
    }

    fn text(t: &str) -> ResponseFragment {
        ResponseFragment::text(topic(), MessageId::from("m1"), t)
    }

    fn texts(snapshot: &StreamSnapshot) -> Vec<String> {
        snapshot.fragments.iter().map(|f| f.text.clone()).collect()
    }

    #[test]
    fn test_config_default() {
        let config = StreamManagerConfig::default();
        assert_eq!(config.orphan_grace, Duration::from_secs(30));
        assert_eq!(config.overflow_policy, BufferOverflowPolicy::DropOldest);
    }

    #[test]
    fn test_get_or_create_is_idempotent_while_live() {
        let manager = StreamManager::new();
        let a = manager.get_or_create(topic(), "chat", None);
        let b = manager.get_or_create(topic(), "chat", None);

        assert!(a.same_buffer(&b));
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.total_buffers_created(), 1);
    }

    #[test]
    fn test_completed_buffer_is_replaced_on_create() {
        let manager = StreamManager::new();
        let first = manager.get_or_create(topic(), "chat", None);
        first.append(text("old"));
        assert!(manager.mark_completed(&topic()));

        let second = manager.get_or_create(topic(), "chat", None);
        assert!(!first.same_buffer(&second));
        assert!(manager.snapshot(&topic()).unwrap().fragments.is_empty());

        // The retired handle no longer reaches the registry
        assert!(!first.append(text("stale")).is_appended());
        assert!(manager.snapshot(&topic()).unwrap().fragments.is_empty());
    }

    #[test]
    fn test_append_without_buffer_is_noop() {
        let manager = StreamManager::new();
        assert!(!manager.append(&topic(), text("hello")));
        assert!(manager.snapshot(&topic()).is_none());
        assert_eq!(manager.total_fragments_appended(), 0);
    }

    #[test]
    fn test_appends_after_completion_leave_snapshot_unchanged() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        manager.append(&topic(), text("Hello"));
        manager.mark_completed(&topic());
        let before = manager.snapshot(&topic()).unwrap();

        for _ in 0..5 {
            assert!(!manager.append(&topic(), text("late")));
        }

        let after = manager.snapshot(&topic()).unwrap();
        assert_eq!(before, after);
        assert_eq!(manager.dropped_late_writes(), 5);
    }

    #[test]
    fn test_double_completion_returns_false() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        assert!(manager.mark_completed(&topic()));
        assert!(!manager.mark_completed(&topic()));
        assert!(!manager.mark_completed(&TopicId::from("missing")));
    }

    #[test]
    fn test_complete_prompt_completes_at_zero() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        assert!(manager.try_increment_pending(&topic()));
        assert!(manager.try_increment_pending(&topic()));

        assert_eq!(manager.complete_prompt(&topic()), Some(1));
        assert!(!manager.snapshot(&topic()).unwrap().completed);

        assert_eq!(manager.complete_prompt(&topic()), Some(0));
        assert!(manager.snapshot(&topic()).unwrap().completed);
    }

    #[test]
    fn test_complete_prompt_underflow_stays_at_zero() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        assert_eq!(manager.complete_prompt(&topic()), Some(0));
        assert_eq!(manager.snapshot(&topic()).unwrap().pending, 0);
        assert_eq!(manager.complete_prompt(&TopicId::from("missing")), None);
    }

    #[test]
    fn test_try_increment_pending_requires_buffer() {
        let manager = StreamManager::new();
        assert!(!manager.try_increment_pending(&topic()));
    }

    #[tokio::test]
    async fn test_snapshot_and_subscribe_sees_everything_once() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        manager.append(&topic(), text("a"));

        let (snapshot, mut live) = manager.snapshot_and_subscribe(&topic()).unwrap();
        assert_eq!(texts(&snapshot), vec!["a"]);

        manager.append(&topic(), text("b"));
        manager.mark_completed(&topic());

        match live.recv().await {
            Some(LiveEvent::Fragment(f)) => {
                assert_eq!(f.text, "b");
                assert_eq!(f.sequence, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(live.recv().await, Some(LiveEvent::Completed));
        assert_eq!(live.recv().await, None);
    }

    #[test]
    fn test_live_subscription_wakes_on_append() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        let (_, mut live) = manager.snapshot_and_subscribe(&topic()).unwrap();

        let mut next = tokio_test::task::spawn(live.recv());
        tokio_test::assert_pending!(next.poll());

        assert!(manager.append(&topic(), text("hi")));
        assert!(next.is_woken());
        match tokio_test::assert_ready!(next.poll()) {
            Some(LiveEvent::Fragment(f)) => assert_eq!(f.text, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_to_completed_buffer_is_closed() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        manager.mark_completed(&topic());

        let (snapshot, mut live) = manager.snapshot_and_subscribe(&topic()).unwrap();
        assert!(snapshot.completed);
        assert_eq!(live.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_fires_token_and_notifies_subscribers() {
        let notifier = Arc::new(BroadcastNotifier::new(8));
        let mut notifications = notifier.subscribe();
        let manager = StreamManager::with_notifier(StreamManagerConfig::default(), notifier);

        let handle = manager.get_or_create(topic(), "chat", None);
        let token = handle.cancellation_token();
        let (_, mut live) = manager.snapshot_and_subscribe(&topic()).unwrap();

        assert!(manager.cancel(&topic()));
        assert!(token.is_cancelled());
        assert_eq!(live.recv().await, Some(LiveEvent::Cancelled));
        assert_eq!(
            notifications.recv().await.unwrap(),
            StreamNotification::StreamCancelled { topic: topic() }
        );

        // Already finished
        assert!(!manager.cancel(&topic()));
    }

    #[tokio::test]
    async fn test_cleanup_ends_subscription() {
        let manager = StreamManager::new();
        let handle = manager.get_or_create(topic(), "chat", None);
        let (_, mut live) = manager.snapshot_and_subscribe(&topic()).unwrap();

        assert!(manager.cleanup(&topic()));
        assert!(!manager.cleanup(&topic()));
        assert_eq!(live.recv().await, None);
        assert!(handle.cancellation_token().is_cancelled());
        assert!(manager.snapshot(&topic()).is_none());
    }

    #[test]
    fn test_dropped_producer_guard_detaches() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);

        {
            let guard = manager.begin_producing(&topic()).unwrap();
            guard.append(text("partial"));
        }

        let snapshot = manager.snapshot(&topic()).unwrap();
        assert!(!snapshot.producer_active);
        assert!(!snapshot.completed);
    }

    #[test]
    fn test_completed_producer_guard() {
        let manager = StreamManager::new();
        manager.get_or_create(topic(), "chat", None);
        let guard = manager.begin_producing(&topic()).unwrap();
        assert!(guard.complete());

        assert!(manager.snapshot(&topic()).unwrap().completed);
        assert!(manager.begin_producing(&topic()).is_none());
    }

    #[test]
    fn test_sweep_removes_only_orphans() {
        let manager = StreamManager::with_config(StreamManagerConfig {
            orphan_grace: Duration::ZERO,
            ..Default::default()
        });
        let orphan = TopicId::from("orphan");
        let live = TopicId::from("live");

        manager.get_or_create(orphan.clone(), "orphan", None);
        manager.try_increment_pending(&orphan);
        manager.detach_producer(&orphan);
        manager.get_or_create(live.clone(), "live", None);

        assert_eq!(manager.sweep_orphans(), 1);
        assert!(manager.snapshot(&orphan).is_none());
        assert!(manager.snapshot(&live).is_some());
    }

    #[test]
    fn test_sweep_removes_stalled_producer() {
        let manager = StreamManager::with_config(StreamManagerConfig {
            stalled_producer: Duration::ZERO,
            ..Default::default()
        });
        manager.get_or_create(topic(), "chat", None);
        assert_eq!(manager.sweep_orphans(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_sweeper_stops_on_cancel() {
        let manager = Arc::new(StreamManager::with_config(StreamManagerConfig {
            orphan_grace: Duration::ZERO,
            sweep_interval: Duration::from_millis(5),
            ..Default::default()
        }));
        manager.get_or_create(topic(), "chat", None);
        manager.detach_producer(&topic());

        let cancel = CancellationToken::new();
        let sweeper = manager.spawn_orphan_sweeper(cancel.clone());

        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        for _ in 0..200 {
            if manager.is_empty() {
                break;
            }
            ticker.tick().await;
        }
        assert!(manager.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_notification() {
        let notifier = Arc::new(BroadcastNotifier::new(8));
        let mut rx = notifier.subscribe();
        let manager = StreamManager::with_notifier(StreamManagerConfig::default(), notifier);

        manager.get_or_create(topic(), "chat", None);
        manager.try_increment_pending(&topic());
        manager.complete_prompt(&topic());

        assert_eq!(
            rx.recv().await.unwrap(),
            StreamNotification::StreamCompleted { topic: topic() }
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_share_one_sequence() {
        let manager = Arc::new(StreamManager::new());
        let mut tasks = JoinSet::new();

        for worker in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.spawn(async move {
                let handle = manager.get_or_create(topic(), "chat", None);
                for i in 0..50 {
                    handle.append(text(&format!("{worker}-{i}")));
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        let snapshot = manager.snapshot(&topic()).unwrap();
        assert_eq!(snapshot.fragments.len(), 400);
        let sequences: Vec<u64> = snapshot.fragments.iter().map(|f| f.sequence).collect();
        let expected: Vec<u64> = (1..=400).collect();
        assert_eq!(sequences, expected);
        assert_eq!(manager.total_buffers_created(), 1);
    }
}
