//! Queue source client
//!
//! Bridges an external job queue: queued prompts are pushed into
//! [`QueueSourceClient::enqueue_sender`], and each finished reply is
//! published as one [`QueueReply`] rather than as a stream of deltas.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{idle_ticker, Inbox, ReplyAccumulator, DEFAULT_REPLY_TIMEOUT};
use super::traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
use crate::messages::{MessageId, Prompt, Provenance, TopicKey};

/// A completed reply, ready to publish back to the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReply {
    /// Conversation the reply belongs to
    pub key: TopicKey,
    /// Reply id
    pub message_id: Option<MessageId>,
    /// Full reply text
    pub text: String,
}

/// Source client for an external queue
#[derive(Debug)]
pub struct QueueSourceClient {
    inbox: Inbox,
    replies: mpsc::Sender<QueueReply>,
    reply_timeout: Duration,
}

impl QueueSourceClient {
    /// Create a client and the receiver its replies are published on
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueueReply>) {
        let (replies, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                inbox: Inbox::new(capacity),
                replies,
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
            },
            rx,
        )
    }

    /// Give up on an unfinished reply after it has been idle this long
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Where the queue consumer pushes prompts
    #[must_use]
    pub fn enqueue_sender(&self) -> mpsc::Sender<Prompt> {
        self.inbox.sender()
    }
}

#[async_trait]
impl SourceClient for QueueSourceClient {
    fn name(&self) -> &str {
        "queue"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Queue
    }

    async fn read_prompts(
        &self,
        _poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError> {
        let rx = self.inbox.take(self.name())?;
        Ok(ReceiverStream::new(rx)
            .map(Ok)
            .take_until(cancel.cancelled_owned())
            .boxed())
    }

    async fn process_response_stream(
        &self,
        mut updates: UpdateStream,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut accumulator = ReplyAccumulator::default();
        let mut sweep = idle_ticker(self.reply_timeout);

        loop {
            let update = tokio::select! {
                () = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    let evicted = accumulator.evict_idle(Instant::now(), self.reply_timeout);
                    if evicted > 0 {
                        debug!(evicted, "Idle queue replies given up");
                    }
                    continue;
                }
                next = updates.next() => match next {
                    Some(update) => update,
                    None => break,
                },
            };

            let topic = update.topic_id();
            let Some(text) = accumulator.push(&topic, &update.fragment) else {
                continue;
            };

            let reply = QueueReply {
                key: update.key,
                message_id: update.fragment.message_id,
                text,
            };
            if self.replies.send(reply).await.is_err() {
                warn!(topic = %topic, "Queue reply receiver dropped");
                return Err(ClientError::Closed("queue replies".to_string()));
            }
            debug!(topic = %topic, "Queue reply published");
        }

        if accumulator.in_flight() > 0 {
            debug!(in_flight = accumulator.in_flight(), "Queue client stopped with unfinished replies");
        }
        Ok(())
    }

    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        _cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError> {
        Ok(request.key())
    }
}
