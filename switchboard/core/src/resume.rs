//! Stream Resume Coordination
//!
//! Rebuilds a viewer's picture of a topic when it subscribes or reconnects
//! while a response may still be streaming:
//!
//! 1. Snapshot the topic's buffer and subscribe to its live feed, atomically.
//! 2. Load history (cached per topic) and reconcile the snapshot against it.
//! 3. Emit the completed turns, then the residual streaming turn, then the
//!    in-flight prompt if the viewer has not seen it yet, then every approval
//!    the snapshot carries.
//! 4. Relay live fragments until the stream completes, is cancelled, or the
//!    viewer goes away.
//!
//! A coordinator belongs to one viewer connection. Its per-topic flags stop
//! a second resume of the same topic from running while one is in flight;
//! they are cleared whenever a resume ends, however it ends.
//!
//! Cancelling a resume only stops this viewer's consumption. The buffer and
//! its producer are untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::history::{HistoryError, HistoryMessage, HistoryStore};
use crate::messages::{ApprovalRequest, MessageId, MessageRole, ResponseFragment, TopicId, Turn};
use crate::reconcile::{rebuild_with, ReconcileOptions};
use crate::streaming::{LiveEvent, StreamManager, StreamSnapshot};

// ============================================================================
// Configuration
// ============================================================================

/// Resume tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeConfig {
    /// Reconciliation options
    pub reconcile: ReconcileOptions,
    /// Topics whose history is kept cached
    pub cache_topics: usize,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileOptions::default(),
            cache_topics: 64,
        }
    }
}

// ============================================================================
// View Events
// ============================================================================

/// What a resuming viewer is told, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewEvent {
    /// A finished assistant or system turn
    CompletedTurn(Turn),
    /// The reply currently in progress
    StreamingTurn(Turn),
    /// A user turn
    UserTurn(Turn),
    /// A live fragment appended after the snapshot
    Fragment(ResponseFragment),
    /// A tool call is waiting for approval
    ApprovalRequested(ApprovalRequest),
    /// The stream finished
    StreamCompleted,
    /// The stream was cancelled
    StreamCancelled,
    /// Something went wrong; the turn explains it to the user
    Error(Turn),
}

/// How a resume ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The viewer is already following this topic live
    AlreadyStreaming,
    /// Another resume of this topic is in flight
    AlreadyResuming,
    /// No buffer, or a finished empty one; history alone suffices
    NothingToResume,
    /// Replayed through to completion
    Completed,
    /// The stream or the resume was cancelled
    Cancelled,
    /// Resume failed; an error turn was emitted
    Failed,
}

// ============================================================================
// Per-topic State
// ============================================================================

#[derive(Debug, Default)]
struct TopicViewState {
    resuming: bool,
    streaming: bool,
}

/// Clears the topic's flags however the resume ends
struct ResumeGuard<'a> {
    views: &'a DashMap<TopicId, TopicViewState>,
    topic: &'a TopicId,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.views.remove(self.topic);
    }
}

#[derive(Debug)]
struct HistoryCache {
    capacity: usize,
    entries: VecDeque<(TopicId, Arc<Vec<HistoryMessage>>)>,
}

impl HistoryCache {
    fn get(&self, topic: &TopicId) -> Option<Arc<Vec<HistoryMessage>>> {
        self.entries
            .iter()
            .find(|(cached, _)| cached == topic)
            .map(|(_, history)| Arc::clone(history))
    }

    fn insert(&mut self, topic: TopicId, history: Arc<Vec<HistoryMessage>>) {
        if self.capacity == 0 {
            return;
        }
        self.remove(&topic);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((topic, history));
    }

    fn remove(&mut self, topic: &TopicId) {
        self.entries.retain(|(cached, _)| cached != topic);
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Resumes topics for one viewer
pub struct StreamResumeCoordinator {
    streams: Arc<StreamManager>,
    history: Arc<dyn HistoryStore>,
    config: ResumeConfig,
    views: DashMap<TopicId, TopicViewState>,
    cache: Mutex<HistoryCache>,
}

impl StreamResumeCoordinator {
    /// Create a coordinator reading `streams` and `history`
    #[must_use]
    pub fn new(
        streams: Arc<StreamManager>,
        history: Arc<dyn HistoryStore>,
        config: ResumeConfig,
    ) -> Self {
        let cache = HistoryCache {
            capacity: config.cache_topics,
            entries: VecDeque::new(),
        };
        Self {
            streams,
            history,
            config,
            views: DashMap::new(),
            cache: Mutex::new(cache),
        }
    }

    /// Whether the viewer is following the topic live
    #[must_use]
    pub fn is_streaming(&self, topic: &TopicId) -> bool {
        self.views.get(topic).is_some_and(|state| state.streaming)
    }

    /// Whether a resume of the topic is in flight
    #[must_use]
    pub fn is_resuming(&self, topic: &TopicId) -> bool {
        self.views.get(topic).is_some_and(|state| state.resuming)
    }

    /// Topics with a resume in flight
    #[must_use]
    pub fn tracked_topics(&self) -> usize {
        self.views.len()
    }

    /// Drop every local trace of a topic
    pub fn forget(&self, topic: &TopicId) {
        self.views.remove(topic);
        self.cache.lock().remove(topic);
    }

    /// Drop the cached history of a topic
    pub fn invalidate_history(&self, topic: &TopicId) {
        self.cache.lock().remove(topic);
    }

    async fn load_history(&self, topic: &TopicId) -> Result<Arc<Vec<HistoryMessage>>, HistoryError> {
        if let Some(history) = self.cache.lock().get(topic) {
            return Ok(history);
        }
        let history = Arc::new(self.history.get_history(topic).await?);
        self.cache.lock().insert(topic.clone(), Arc::clone(&history));
        Ok(history)
    }

    /// Resume `topic` into `view`
    ///
    /// Returns once the stream completes or is cancelled, `cancel` fires, or
    /// `view` is dropped.
    pub async fn resume(
        &self,
        topic: &TopicId,
        view: &mpsc::Sender<ViewEvent>,
        cancel: CancellationToken,
    ) -> ResumeOutcome {
        {
            let mut state = self.views.entry(topic.clone()).or_default();
            if state.streaming {
                return ResumeOutcome::AlreadyStreaming;
            }
            if state.resuming {
                return ResumeOutcome::AlreadyResuming;
            }
            state.resuming = true;
        }
        let _guard = ResumeGuard {
            views: &self.views,
            topic,
        };

        let Some((snapshot, mut live)) = self.streams.snapshot_and_subscribe(topic) else {
            debug!(topic = %topic, "No buffer to resume");
            return ResumeOutcome::NothingToResume;
        };
        if !snapshot.producer_active && snapshot.fragments.is_empty() {
            debug!(topic = %topic, "Buffer finished and empty, nothing to resume");
            return ResumeOutcome::NothingToResume;
        }

        let history = tokio::select! {
            () = cancel.cancelled() => return ResumeOutcome::Cancelled,
            history = self.load_history(topic) => history,
        };
        let history = match history {
            Ok(history) => history,
            Err(error) => {
                error!(topic = %topic, %error, "Failed to load history for resume");
                let _ = view
                    .send(ViewEvent::Error(Turn::system(format!(
                        "Could not restore this conversation: {error}"
                    ))))
                    .await;
                return ResumeOutcome::Failed;
            }
        };

        info!(
            topic = %topic,
            fragments = snapshot.fragments.len(),
            producer_active = snapshot.producer_active,
            "Resuming stream"
        );

        if !self.replay_snapshot(topic, &snapshot, &history, view).await {
            return ResumeOutcome::Cancelled;
        }

        if snapshot.completed || !snapshot.producer_active {
            self.invalidate_history(topic);
            let _ = view.send(ViewEvent::StreamCompleted).await;
            return ResumeOutcome::Completed;
        }

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(topic = %topic, "Resume cancelled by viewer");
                    return ResumeOutcome::Cancelled;
                }
                event = live.recv() => event,
            };

            match event {
                Some(LiveEvent::Fragment(fragment)) => {
                    if let Some(approval) = &fragment.approval {
                        if view
                            .send(ViewEvent::ApprovalRequested(approval.clone()))
                            .await
                            .is_err()
                        {
                            return ResumeOutcome::Cancelled;
                        }
                    }
                    if view.send(ViewEvent::Fragment(fragment)).await.is_err() {
                        return ResumeOutcome::Cancelled;
                    }
                }
                Some(LiveEvent::Completed) | None => {
                    self.invalidate_history(topic);
                    let _ = view.send(ViewEvent::StreamCompleted).await;
                    return ResumeOutcome::Completed;
                }
                Some(LiveEvent::Cancelled) => {
                    self.invalidate_history(topic);
                    let _ = view.send(ViewEvent::StreamCancelled).await;
                    return ResumeOutcome::Cancelled;
                }
            }
        }
    }

    /// Emit the reconciled snapshot; false if the viewer went away
    async fn replay_snapshot(
        &self,
        topic: &TopicId,
        snapshot: &StreamSnapshot,
        history: &[HistoryMessage],
        view: &mpsc::Sender<ViewEvent>,
    ) -> bool {
        let known: Vec<String> = history
            .iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .map(|message| message.text.clone())
            .collect();
        let rebuilt = rebuild_with(&snapshot.fragments, &known, &self.config.reconcile);

        let mut seen_prompts: HashSet<String> = history
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .map(|message| message.text.clone())
            .collect();

        let mut events = Vec::with_capacity(rebuilt.completed.len() + 3);
        for turn in rebuilt.completed {
            if turn.role == MessageRole::User {
                seen_prompts.insert(turn.text.clone());
                events.push(ViewEvent::UserTurn(turn));
            } else {
                events.push(ViewEvent::CompletedTurn(turn));
            }
        }

        if let Some(mut state) = self.views.get_mut(topic) {
            state.streaming = true;
        }
        events.push(ViewEvent::StreamingTurn(rebuilt.streaming));

        if !snapshot.current_prompt.is_empty() && !seen_prompts.contains(&snapshot.current_prompt) {
            events.push(ViewEvent::UserTurn(Turn::user(
                snapshot.current_sender.clone(),
                snapshot.current_prompt.clone(),
            )));
        }

        events.extend(snapshot_approvals(&snapshot.fragments).map(ViewEvent::ApprovalRequested));

        for event in events {
            if view.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Every approval carried by the snapshot, in fragment order
///
/// A completed reply still re-signals its approval: the viewer may never
/// have seen it, and it has to be observable before the stream completes.
fn snapshot_approvals(fragments: &[ResponseFragment]) -> impl Iterator<Item = ApprovalRequest> + '_ {
    fragments
        .iter()
        .filter_map(|fragment| fragment.approval.clone())
}

impl std::fmt::Debug for StreamResumeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResumeCoordinator")
            .field("tracked_topics", &self.tracked_topics())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
