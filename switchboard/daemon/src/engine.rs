//! Loopback Conversation Engine
//!
//! Stands in for the model so the daemon can be driven end to end without
//! one: every prompt is answered by echoing it back, a word per fragment.
//!
//! The engine owns the producer side of a topic. It opens the buffer,
//! records the prompt, writes history, and hands the reply to the composite
//! client as a stream of updates ending with a completion.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use switchboard_core::{
    CompositeClient, HistoryMessage, HistoryStore, MessageId, Prompt, Provenance,
    ResponseFragment, ResponseUpdate, SourceClient, StreamManager, StreamNotification, TopicKey,
    TopicRequest,
};

/// Answers prompts by echoing them
pub struct LoopbackEngine {
    composite: Arc<CompositeClient>,
    streams: Arc<StreamManager>,
    history: Arc<dyn HistoryStore>,
    updates: mpsc::Sender<ResponseUpdate>,
}

impl LoopbackEngine {
    /// Create an engine sending its replies to `updates`
    pub fn new(
        composite: Arc<CompositeClient>,
        history: Arc<dyn HistoryStore>,
        updates: mpsc::Sender<ResponseUpdate>,
    ) -> Self {
        let streams = Arc::clone(composite.stream_manager());
        Self {
            composite,
            streams,
            history,
            updates,
        }
    }

    /// The reply the engine gives to `text`
    pub fn reply_to(text: &str) -> String {
        format!("You said: {text}")
    }

    /// Open the prompt's topic and count the prompt as pending
    async fn open_topic(&self, prompt: &Prompt, cancel: CancellationToken) -> Result<TopicKey> {
        if prompt.provenance == Provenance::Ui {
            let topic = prompt.topic_id();
            self.streams
                .get_or_create(topic.clone(), &prompt.key.chat_id, Some(prompt.sender.clone()));
            if self.streams.try_increment_pending(&topic) {
                self.streams
                    .notify(StreamNotification::StreamStarted { topic });
            }
            return Ok(prompt.key.clone());
        }

        let mut request = TopicRequest::new(
            prompt.provenance,
            prompt.key.chat_id.clone(),
            prompt.key.agent_id.clone(),
            prompt.key.chat_id.clone(),
        );
        if let Some(thread) = &prompt.key.thread_id {
            request = request.with_thread(thread.clone());
        }
        self.composite
            .create_or_resume_topic(&request, cancel)
            .await
            .with_context(|| format!("Failed to open topic for {} prompt", prompt.provenance))
    }

    /// Answer one prompt
    ///
    /// # Errors
    ///
    /// Fails if the topic cannot be opened, history cannot be written, or the
    /// response channel is closed.
    pub async fn handle(&self, prompt: Prompt, cancel: CancellationToken) -> Result<()> {
        let key = self.open_topic(&prompt, cancel.clone()).await?;
        let topic = key.topic_id();
        info!(topic = %topic, provenance = %prompt.provenance, "Answering prompt");

        self.streams
            .set_current_prompt(&topic, prompt.text.clone(), Some(prompt.sender.clone()));
        self.streams.append(
            &topic,
            ResponseFragment::user_message(topic.clone(), prompt.sender.clone(), prompt.text.clone()),
        );
        self.history
            .append(&topic, HistoryMessage::user(prompt.sender.clone(), prompt.text.clone()))
            .await
            .context("Failed to record prompt in history")?;

        let message_id = MessageId::new();
        let reply = Self::reply_to(&prompt.text);
        for word in reply.split_inclusive(' ') {
            if cancel.is_cancelled() {
                debug!(topic = %topic, "Reply abandoned on shutdown");
                return Ok(());
            }
            let fragment = ResponseFragment::text(topic.clone(), message_id.clone(), word);
            self.send(ResponseUpdate::new(key.clone(), fragment)).await?;
        }

        self.history
            .append(&topic, HistoryMessage::assistant(message_id.clone(), reply))
            .await
            .context("Failed to record reply in history")?;
        self.send(ResponseUpdate::new(
            key,
            ResponseFragment::completion(topic, message_id),
        ))
        .await
    }

    async fn send(&self, update: ResponseUpdate) -> Result<()> {
        self.updates
            .send(update)
            .await
            .context("Response channel closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use switchboard_core::{
        BroadcastNotifier, CompositeConfig, InMemoryHistoryStore, MessageRole, SenderId,
        StreamManagerConfig, TerminalSourceClient,
    };
    use tokio::io::BufReader;
    use tokio_stream::wrappers::ReceiverStream;

    fn engine() -> (
        LoopbackEngine,
        Arc<InMemoryHistoryStore>,
        mpsc::Receiver<ResponseUpdate>,
        TopicKey,
    ) {
        let terminal = TerminalSourceClient::new(
            BufReader::new(&b""[..]),
            tokio::io::sink(),
            "agent",
            SenderId::from("me"),
        );
        let key = terminal.key().clone();
        let clients: Vec<Arc<dyn SourceClient>> = vec![Arc::new(terminal)];
        let composite = Arc::new(CompositeClient::new(
            clients,
            Arc::new(StreamManager::new()),
            CompositeConfig::default(),
        ));
        let history = Arc::new(InMemoryHistoryStore::new());
        let (tx, rx) = mpsc::channel(64);
        let engine = LoopbackEngine::new(composite, Arc::clone(&history) as Arc<dyn HistoryStore>, tx);
        (engine, history, rx, key)
    }

    #[tokio::test]
    async fn test_reply_streams_word_by_word_and_completes() {
        let (engine, history, rx, key) = engine();
        let prompt = Prompt::new(key.clone(), SenderId::from("me"), "hello there");

        engine.handle(prompt, CancellationToken::new()).await.unwrap();
        drop(engine);

        let updates: Vec<ResponseUpdate> = ReceiverStream::new(rx).collect().await;
        let text: String = updates.iter().map(|u| u.fragment.text.as_str()).collect();
        assert_eq!(text, "You said: hello there");
        assert!(updates.last().unwrap().fragment.is_complete);
        assert!(updates.iter().all(|u| u.key == key));

        let recorded = history.get_history(&key.topic_id()).await.unwrap();
        let roles: Vec<MessageRole> = recorded.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    }

    #[tokio::test]
    async fn test_ui_prompt_announces_stream_start() {
        let notifier = BroadcastNotifier::new(16);
        let mut notifications = notifier.subscribe();
        let streams = Arc::new(StreamManager::with_notifier(
            StreamManagerConfig::default(),
            Arc::new(notifier),
        ));
        let composite = Arc::new(CompositeClient::new(Vec::new(), streams, CompositeConfig::default()));
        let (tx, _rx) = mpsc::channel(64);
        let engine = LoopbackEngine::new(composite, Arc::new(InMemoryHistoryStore::new()), tx);

        let key = TopicKey::new(Provenance::Ui, "chat", "agent");
        engine
            .handle(Prompt::new(key.clone(), SenderId::from("me"), "hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            StreamNotification::StreamStarted {
                topic: key.topic_id()
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_prompt_opens_buffer_with_pending() {
        let (engine, _history, _rx, key) = engine();
        let prompt = Prompt::new(key.clone(), SenderId::from("me"), "hi");

        engine.handle(prompt, CancellationToken::new()).await.unwrap();

        let snapshot = engine.streams.snapshot(&key.topic_id()).unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.current_prompt, "hi");
        assert!(snapshot.fragments[0].is_user_message());
    }

    #[tokio::test]
    async fn test_cancelled_reply_sends_nothing() {
        let (engine, _history, mut rx, key) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine
            .handle(Prompt::new(key, SenderId::from("me"), "bye"), cancel)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
