//! Chat-bot source client
//!
//! Like the queue client, replies are delivered whole. Each reply is
//! addressed to the bot platform's chat and threaded under the platform
//! message that started the exchange. The bot platform can also receive
//! unprompted (scheduled) messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{idle_ticker, Inbox, ReplyAccumulator, DEFAULT_REPLY_TIMEOUT};
use super::traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
use crate::messages::{MessageId, Prompt, Provenance, TopicId, TopicKey};

/// Message to post on the bot platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotReply {
    /// Platform chat
    pub chat_id: String,
    /// Platform thread, if any
    pub thread_id: Option<String>,
    /// Platform message this answers
    pub reply_to: Option<MessageId>,
    /// Message text
    pub text: String,
}

/// Platform message an open exchange replies to
#[derive(Clone, Debug)]
struct Exchange {
    reply_to: MessageId,
    opened: Instant,
}

/// Source client for a chat-bot platform
#[derive(Debug)]
pub struct BotSourceClient {
    inbox: Inbox,
    replies: mpsc::Sender<BotReply>,
    /// Removed once answered, expired, or when the response stream ends
    reply_targets: Arc<DashMap<TopicId, Exchange>>,
    reply_timeout: Duration,
}

impl BotSourceClient {
    /// Create a client and the receiver its outgoing messages are published on
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BotReply>) {
        let (replies, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                inbox: Inbox::new(capacity),
                replies,
                reply_targets: Arc::new(DashMap::new()),
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
            },
            rx,
        )
    }

    /// Give up on an unanswered exchange after this long
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Where the platform webhook pushes prompts
    #[must_use]
    pub fn prompt_sender(&self) -> mpsc::Sender<Prompt> {
        self.inbox.sender()
    }

    /// Exchanges waiting for a reply
    #[must_use]
    pub fn open_exchanges(&self) -> usize {
        self.reply_targets.len()
    }

    /// Drop exchanges opened more than the reply timeout before `now`
    fn expire_exchanges(&self, now: Instant) -> usize {
        let before = self.reply_targets.len();
        self.reply_targets
            .retain(|_, exchange| now.saturating_duration_since(exchange.opened) <= self.reply_timeout);
        before.saturating_sub(self.reply_targets.len())
    }

    /// Post an unprompted message to a chat
    pub async fn send_scheduled(&self, key: &TopicKey, text: impl Into<String>) -> Result<(), ClientError> {
        let reply = BotReply {
            chat_id: key.chat_id.clone(),
            thread_id: key.thread_id.clone(),
            reply_to: None,
            text: text.into(),
        };
        self.replies
            .send(reply)
            .await
            .map_err(|_| ClientError::Closed("bot replies".to_string()))
    }
}

#[async_trait]
impl SourceClient for BotSourceClient {
    fn name(&self) -> &str {
        "bot"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Bot
    }

    async fn read_prompts(
        &self,
        _poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError> {
        let rx = self.inbox.take(self.name())?;
        let targets = Arc::clone(&self.reply_targets);

        Ok(ReceiverStream::new(rx)
            .inspect(move |prompt| {
                if let Some(reply_to) = &prompt.reply_to {
                    targets.entry(prompt.topic_id()).or_insert_with(|| Exchange {
                        reply_to: reply_to.clone(),
                        opened: Instant::now(),
                    });
                }
            })
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

        let result = loop {
            let update = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let evicted = accumulator.evict_idle(now, self.reply_timeout);
                    let expired = self.expire_exchanges(now);
                    if evicted > 0 || expired > 0 {
                        debug!(evicted, expired, "Idle bot exchanges given up");
                    }
                    continue;
                }
                next = updates.next() => match next {
                    Some(update) => update,
                    None => break Ok(()),
                },
            };

            let topic = update.topic_id();
            let answered = update.fragment.is_complete && !update.fragment.is_user_message();
            let text = accumulator.push(&topic, &update.fragment);
            let reply_to = if answered {
                self.reply_targets
                    .remove(&topic)
                    .map(|(_, exchange)| exchange.reply_to)
            } else {
                None
            };
            let Some(text) = text else {
                continue;
            };

            let reply = BotReply {
                chat_id: update.key.chat_id,
                thread_id: update.key.thread_id,
                reply_to,
                text,
            };
            if self.replies.send(reply).await.is_err() {
                warn!(topic = %topic, "Bot reply receiver dropped");
                break Err(ClientError::Closed("bot replies".to_string()));
            }
            debug!(topic = %topic, "Bot reply posted");
        };

        // Nothing answers an exchange once the response stream is gone
        let abandoned = self.reply_targets.len();
        self.reply_targets.clear();
        if abandoned > 0 || accumulator.in_flight() > 0 {
            debug!(abandoned, in_flight = accumulator.in_flight(), "Bot client stopped with open exchanges");
        }
        result
    }

    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        _cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError> {
        Ok(request.key())
    }

    fn supports_scheduled_notifications(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ResponseFragment, ResponseUpdate, SenderId};
    use futures::stream;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_reply_threads_under_starting_message() {
        let (client, mut replies) = BotSourceClient::new(4);
        let key = TopicKey::new(Provenance::Bot, "chat-9", "agent").with_thread("th");
        let topic = key.topic_id();

        let mut prompts = client
            .read_prompts(Duration::ZERO, CancellationToken::new())
            .await
            .unwrap();
        client
            .prompt_sender()
            .send(
                Prompt::new(key.clone(), SenderId::from("u1"), "hey")
                    .with_reply_to(MessageId::from("platform-42")),
            )
            .await
            .unwrap();
        prompts.next().await.unwrap().unwrap();
        assert_eq!(client.open_exchanges(), 1);

        let mid = MessageId::from("m1");
        let updates = stream::iter(vec![ResponseUpdate::new(
            key,
            ResponseFragment::text(topic, mid, "hello").completed(),
        )])
        .boxed();
        client
            .process_response_stream(updates, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            replies.recv().await.unwrap(),
            BotReply {
                chat_id: "chat-9".to_string(),
                thread_id: Some("th".to_string()),
                reply_to: Some(MessageId::from("platform-42")),
                text: "hello".to_string(),
            }
        );
        assert_eq!(client.open_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_reply_closes_its_exchange() {
        let (client, mut replies) = BotSourceClient::new(4);
        let key = TopicKey::new(Provenance::Bot, "chat-3", "agent");
        let topic = key.topic_id();

        let mut prompts = client
            .read_prompts(Duration::ZERO, CancellationToken::new())
            .await
            .unwrap();
        client
            .prompt_sender()
            .send(
                Prompt::new(key.clone(), SenderId::from("u1"), "hey")
                    .with_reply_to(MessageId::from("platform-7")),
            )
            .await
            .unwrap();
        prompts.next().await.unwrap().unwrap();
        assert_eq!(client.open_exchanges(), 1);

        // One partial fragment, then the stream ends without a completion
        let updates = stream::iter(vec![ResponseUpdate::new(
            key,
            ResponseFragment::text(topic, MessageId::from("m1"), "hal"),
        )])
        .boxed();
        client
            .process_response_stream(updates, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.open_exchanges(), 0);
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_reply_still_answers_its_exchange() {
        let (client, _replies) = BotSourceClient::new(4);
        let key = TopicKey::new(Provenance::Bot, "chat-4", "agent");
        let topic = key.topic_id();

        let mut prompts = client
            .read_prompts(Duration::ZERO, CancellationToken::new())
            .await
            .unwrap();
        client
            .prompt_sender()
            .send(
                Prompt::new(key.clone(), SenderId::from("u1"), "hey")
                    .with_reply_to(MessageId::from("platform-8")),
            )
            .await
            .unwrap();
        prompts.next().await.unwrap().unwrap();

        let client = Arc::new(client);
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .process_response_stream(ReceiverStream::new(rx).boxed(), cancel)
                    .await
            })
        };

        tx.send(ResponseUpdate::new(
            key,
            ResponseFragment::completion(topic, MessageId::from("m1")),
        ))
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.open_exchanges() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("exchange answered while the stream is still open");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_stale_exchanges_expire() {
        let (client, _replies) = BotSourceClient::new(1);
        let client = client.with_reply_timeout(Duration::from_secs(60));
        client.reply_targets.insert(
            TopicId::from("bot/chat"),
            Exchange {
                reply_to: MessageId::from("platform-1"),
                opened: Instant::now(),
            },
        );

        assert_eq!(client.expire_exchanges(Instant::now()), 0);
        assert_eq!(client.expire_exchanges(Instant::now() + Duration::from_secs(61)), 1);
        assert_eq!(client.open_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_message() {
        let (client, mut replies) = BotSourceClient::new(4);
        assert!(client.supports_scheduled_notifications());

        let key = TopicKey::new(Provenance::Bot, "chat-1", "agent");
        client.send_scheduled(&key, "reminder").await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.reply_to, None);
        assert_eq!(reply.text, "reminder");
    }
}
