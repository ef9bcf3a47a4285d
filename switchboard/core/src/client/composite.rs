//! Composite Client
//!
//! Presents any number of source clients as one. Inbound prompts from every
//! client are merged into a single bounded stream; outbound updates are
//! recorded in the stream registry and fanned out to the sinks the router
//! selects, each through its own bounded channel.
//!
//! # Failure isolation
//!
//! - A client whose prompt stream fails loses its branch of the merge; the
//!   others keep flowing. A client that never finishes starting stalls only
//!   its own branch.
//! - A sink whose channel is full misses that one update. A sink whose
//!   channel is closed is detached for good. Neither ever blocks the
//!   broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
use crate::messages::{Prompt, Provenance, ResponseUpdate, TopicId, TopicKey};
use crate::notifications::StreamNotification;
use crate::routing::{SourceRegistration, SourceRouter};
use crate::streaming::{AppendOutcome, BufferHandle, StreamManager};

// ============================================================================
// Configuration
// ============================================================================

/// Channel sizing for the composite client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeConfig {
    /// Capacity of the merged inbound prompt channel
    pub merge_capacity: usize,
    /// Capacity of each sink's outbound channel
    pub sink_capacity: usize,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            merge_capacity: 256,
            sink_capacity: 512,
        }
    }
}

// ============================================================================
// Broadcast Result
// ============================================================================

/// Outcome of fanning one update out to its sinks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Sinks that accepted the update
    pub delivered: usize,
    /// Sinks whose channel was full; the update was dropped for them
    pub dropped: usize,
    /// Sinks that are gone and have been detached
    pub detached: usize,
}

impl BroadcastResult {
    /// Whether every selected sink accepted the update
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.dropped == 0 && self.detached == 0
    }
}

// ============================================================================
// Sinks
// ============================================================================

struct Sink {
    client: Arc<dyn SourceClient>,
    tx: Mutex<Option<mpsc::Sender<ResponseUpdate>>>,
    rx: Mutex<Option<mpsc::Receiver<ResponseUpdate>>>,
    detached: AtomicBool,
}

impl Sink {
    fn new(client: Arc<dyn SourceClient>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            client,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            detached: AtomicBool::new(false),
        }
    }

    fn detach(&self) -> bool {
        !self.detached.swap(true, Ordering::AcqRel)
    }
}

/// Pending prompts this client added to one buffer
struct Outstanding {
    buffer: BufferHandle,
    count: u32,
}

// ============================================================================
// Composite Client
// ============================================================================

/// One client over many transports
pub struct CompositeClient {
    sinks: Vec<Sink>,
    router: SourceRouter<usize>,
    streams: Arc<StreamManager>,
    config: CompositeConfig,
    /// Pending prompts this client added for non-UI topics
    ///
    /// Entries go when answered, when their buffer is cancelled, swept or
    /// replaced, and when response processing ends.
    outstanding: DashMap<TopicId, Outstanding>,
    processing: AtomicBool,
}

impl CompositeClient {
    /// Compose `clients`, recording outbound updates in `streams`
    ///
    /// The first UI client becomes the UI sink; every client is registered
    /// under its own provenance.
    #[must_use]
    pub fn new(
        clients: Vec<Arc<dyn SourceClient>>,
        streams: Arc<StreamManager>,
        config: CompositeConfig,
    ) -> Self {
        let ui = clients
            .iter()
            .position(|client| client.provenance() == Provenance::Ui);
        let mut registration = match ui {
            Some(index) => SourceRegistration::new(index),
            None => SourceRegistration::headless(),
        };
        for (index, client) in clients.iter().enumerate() {
            registration = registration.register(client.provenance(), index);
        }

        let sinks = clients
            .into_iter()
            .map(|client| Sink::new(client, config.sink_capacity))
            .collect();

        Self {
            sinks,
            router: SourceRouter::new(registration),
            streams,
            config,
            outstanding: DashMap::new(),
            processing: AtomicBool::new(false),
        }
    }

    /// Number of inner clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.sinks.len()
    }

    /// Names of the clients that would receive an update of `provenance`
    #[must_use]
    pub fn sink_names(&self, provenance: Provenance) -> Vec<String> {
        self.router
            .select_sinks(provenance)
            .into_iter()
            .map(|index| self.sinks[index].client.name().to_string())
            .collect()
    }

    /// The stream registry updates are recorded in
    #[must_use]
    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Channel sizing in use
    #[must_use]
    pub fn config(&self) -> &CompositeConfig {
        &self.config
    }

    /// Topics with prompts this client is still waiting to see answered
    #[must_use]
    pub fn outstanding_topics(&self) -> usize {
        self.outstanding.len()
    }

    fn client_for(&self, provenance: Provenance) -> Option<&Arc<dyn SourceClient>> {
        self.sinks
            .iter()
            .map(|sink| &sink.client)
            .find(|client| client.provenance() == provenance)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Record one update in the registry and fan it out to its sinks
    ///
    /// Never blocks: every sink is offered the update with a non-blocking
    /// send. A recorded completion fragment announces the new message and
    /// counts one prompt of its topic as answered.
    pub fn broadcast(&self, update: &ResponseUpdate) -> BroadcastResult {
        let topic = update.topic_id();
        let mut update = update.clone();

        let recorded = match self.streams.get(&topic) {
            Some(handle) => match handle.append(update.fragment.clone()) {
                AppendOutcome::Appended { sequence, .. } => {
                    update.fragment.sequence = sequence;
                    true
                }
                _ => false,
            },
            None => false,
        };

        let mut result = BroadcastResult::default();
        for index in self.router.select_sinks(update.key.provenance) {
            let sink = &self.sinks[index];
            if sink.detached.load(Ordering::Acquire) {
                result.detached += 1;
                continue;
            }

            let Some(tx) = sink.tx.lock().clone() else {
                result.detached += 1;
                continue;
            };

            match tx.try_send(update.clone()) {
                Ok(()) => result.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    result.dropped += 1;
                    warn!(sink = sink.client.name(), topic = %topic, "Sink channel full, dropping update");
                }
                Err(TrySendError::Closed(_)) => {
                    result.detached += 1;
                    if sink.detach() {
                        warn!(sink = sink.client.name(), "Sink channel closed, detaching sink");
                    }
                }
            }
        }

        if recorded && update.fragment.is_complete {
            if update.fragment.message_id.is_some() {
                self.streams
                    .notify(StreamNotification::NewMessage { topic: topic.clone() });
            }
            self.finish_prompt(&topic);
        }

        debug!(
            topic = %topic,
            delivered = result.delivered,
            dropped = result.dropped,
            "Update broadcast"
        );
        result
    }

    fn finish_prompt(&self, topic: &TopicId) {
        self.streams.complete_prompt(topic);
        if let Entry::Occupied(mut entry) = self.outstanding.entry(topic.clone()) {
            let remaining = entry.get().count.saturating_sub(1);
            if remaining == 0 {
                entry.remove();
            } else {
                entry.get_mut().count = remaining;
            }
        }
    }

    /// Count one prompt this client queued on `buffer`
    fn track_prompt(&self, topic: &TopicId, buffer: BufferHandle) {
        let mut entry = self
            .outstanding
            .entry(topic.clone())
            .or_insert_with(|| Outstanding {
                buffer: buffer.clone(),
                count: 0,
            });
        if !entry.buffer.same_buffer(&buffer) {
            *entry = Outstanding { buffer, count: 0 };
        }
        entry.count += 1;
    }

    /// Forget topics whose buffer was cancelled, swept or replaced
    fn prune_outstanding(&self) {
        let stale: Vec<TopicId> = self
            .outstanding
            .iter()
            .filter(|entry| {
                !self
                    .streams
                    .get(entry.key())
                    .is_some_and(|live| live.same_buffer(&entry.value().buffer) && !live.is_completed())
            })
            .map(|entry| entry.key().clone())
            .collect();

        for topic in stale {
            self.outstanding.remove(&topic);
            debug!(topic = %topic, "Stopped tracking prompts of a finished buffer");
        }
    }

    /// Release every pending prompt this client added
    fn release_outstanding(&self) {
        let topics: Vec<TopicId> = self
            .outstanding
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for topic in topics {
            let Some((_, outstanding)) = self.outstanding.remove(&topic) else {
                continue;
            };
            let live = self
                .streams
                .get(&topic)
                .is_some_and(|current| current.same_buffer(&outstanding.buffer));
            if !live {
                continue;
            }
            for _ in 0..outstanding.count {
                self.streams.complete_prompt(&topic);
            }
            debug!(topic = %topic, count = outstanding.count, "Released pending prompts");
        }
    }

    /// One branch of the merge: start `client`, then forward its prompts
    ///
    /// Starting happens inside the branch so a client that never finishes
    /// starting only stalls itself.
    async fn forward_prompts(
        client: Arc<dyn SourceClient>,
        poll_hint: Duration,
        merged: mpsc::Sender<Prompt>,
        cancel: CancellationToken,
    ) {
        let name = client.name().to_string();
        let started = tokio::select! {
            () = cancel.cancelled() => return,
            started = client.read_prompts(poll_hint, cancel.child_token()) => started,
        };
        let mut prompts = match started {
            Ok(prompts) => prompts,
            Err(error) => {
                error!(client = %name, %error, "Source client failed to start, skipping");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = prompts.next() => next,
            };

            match next {
                Some(Ok(prompt)) => {
                    let sent = tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = merged.send(prompt) => sent,
                    };
                    if sent.is_err() {
                        warn!(client = %name, "Merged prompt channel closed, stopping forwarder");
                        break;
                    }
                }
                Some(Err(ClientError::Cancelled)) | None => break,
                Some(Err(error)) => {
                    error!(client = %name, %error, "Source client failed, dropping its prompt stream");
                    break;
                }
            }
        }
        debug!(client = %name, "Source prompt stream ended");
    }
}

impl std::fmt::Debug for CompositeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|sink| sink.client.name()).collect();
        f.debug_struct("CompositeClient")
            .field("clients", &names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for CompositeClient {
    fn name(&self) -> &str {
        "composite"
    }

    /// The composite reports the UI provenance, the one every response reaches.
    fn provenance(&self) -> Provenance {
        Provenance::Ui
    }

    async fn read_prompts(
        &self,
        poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError> {
        if self.sinks.is_empty() {
            return Ok(stream::empty().boxed());
        }

        let (tx, rx) = mpsc::channel(self.config.merge_capacity.max(1));
        let mut branches = JoinSet::new();
        for sink in &self.sinks {
            branches.spawn(Self::forward_prompts(
                Arc::clone(&sink.client),
                poll_hint,
                tx.clone(),
                cancel.clone(),
            ));
        }
        drop(tx);

        tokio::spawn(async move {
            while let Some(joined) = branches.join_next().await {
                if let Err(error) = joined {
                    error!(%error, "Prompt forwarder panicked");
                }
            }
            debug!("Every source prompt stream ended");
        });

        Ok(ReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn process_response_stream(
        &self,
        mut updates: UpdateStream,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        if self.processing.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed(
                "response stream is already being processed".to_string(),
            ));
        }

        let mut consumers = JoinSet::new();
        for sink in &self.sinks {
            let Some(rx) = sink.rx.lock().take() else {
                continue;
            };
            let client = Arc::clone(&sink.client);
            let token = cancel.child_token();
            consumers.spawn(async move {
                let name = client.name().to_string();
                match client
                    .process_response_stream(ReceiverStream::new(rx).boxed(), token)
                    .await
                {
                    Ok(()) | Err(ClientError::Cancelled) => debug!(sink = %name, "Sink finished"),
                    Err(error) => error!(sink = %name, %error, "Sink failed"),
                }
            });
        }

        let cancelled = loop {
            tokio::select! {
                () = cancel.cancelled() => break true,
                next = updates.next() => match next {
                    Some(update) => {
                        self.broadcast(&update);
                    }
                    None => break false,
                },
            }
        };

        if cancelled {
            info!("Response processing cancelled");
        }
        // Nothing will answer what is still pending
        self.release_outstanding();

        // Closing the senders lets every sink drain what it already holds
        for sink in &self.sinks {
            sink.tx.lock().take();
        }
        while let Some(joined) = consumers.join_next().await {
            if let Err(error) = joined {
                error!(%error, "Sink task panicked");
            }
        }

        Ok(())
    }

    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError> {
        let client = self
            .client_for(request.provenance)
            .ok_or(ClientError::NoClientFor(request.provenance))?;
        let key = client.create_or_resume_topic(request, cancel).await?;

        if request.provenance != Provenance::Ui {
            // Make the conversation visible to UI viewers while it streams
            let topic = key.topic_id();
            self.prune_outstanding();
            let buffer = self.streams.get_or_create(topic.clone(), &request.name, None);
            if self.streams.try_increment_pending(&topic) {
                self.track_prompt(&topic, buffer);
            }
            self.streams
                .notify(StreamNotification::StreamStarted { topic: topic.clone() });
            info!(topic = %topic, provenance = %request.provenance, "Stream started for non-UI topic");
        }

        Ok(key)
    }

    fn supports_scheduled_notifications(&self) -> bool {
        self.sinks
            .iter()
            .any(|sink| sink.client.supports_scheduled_notifications())
    }
}
