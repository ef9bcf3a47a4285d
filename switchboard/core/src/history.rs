//! Conversation History
//!
//! The persisted record of finished turns. History is authoritative and only
//! ever grows: the reconciler strips buffered content that history already
//! holds, which only works if no concurrent writer can lose an append.
//! [`HistoryStore::append`] is therefore a single atomic operation; call
//! sites never read, extend and write back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{MessageId, MessageRole, SenderId, TopicId};

/// Errors from a history backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// Backend could not be reached
    #[error("history unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be read back
    #[error("history for {topic} is corrupt: {reason}")]
    Corrupt {
        /// Affected topic
        topic: TopicId,
        /// What went wrong
        reason: String,
    },
}

/// One persisted message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Author
    pub role: MessageRole,
    /// Message text
    pub text: String,
    /// Sender of a user message
    pub sender: Option<SenderId>,
    /// Reply id of an assistant message
    pub message_id: Option<MessageId>,
    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
}

impl HistoryMessage {
    /// A user message recorded now
    pub fn user(sender: SenderId, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            sender: Some(sender),
            message_id: None,
            timestamp: Utc::now(),
        }
    }

    /// An assistant message recorded now
    pub fn assistant(message_id: MessageId, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            sender: None,
            message_id: Some(message_id),
            timestamp: Utc::now(),
        }
    }
}

/// Persistence collaborator
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Every message recorded for the topic, oldest first
    async fn get_history(&self, topic: &TopicId) -> Result<Vec<HistoryMessage>, HistoryError>;

    /// Atomically append one message
    async fn append(&self, topic: &TopicId, message: HistoryMessage) -> Result<(), HistoryError>;
}

/// Process-local history
///
/// Each topic's list lives behind its own map entry, so appends to one topic
/// are serialised by the entry lock and never lose updates.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    topics: DashMap<TopicId, Vec<HistoryMessage>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with history
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drop a topic's history
    pub fn remove(&self, topic: &TopicId) -> bool {
        self.topics.remove(topic).is_some()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn get_history(&self, topic: &TopicId) -> Result<Vec<HistoryMessage>, HistoryError> {
        Ok(self
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn append(&self, topic: &TopicId, message: HistoryMessage) -> Result<(), HistoryError> {
        self.topics.entry(topic.clone()).or_default().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn test_unknown_topic_has_empty_history() {
        let store = InMemoryHistoryStore::new();
        let history = store.get_history(&TopicId::from("none")).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let store = InMemoryHistoryStore::new();
        let topic = TopicId::from("t");
        store
            .append(&topic, HistoryMessage::user(SenderId::from("alice"), "hi"))
            .await
            .unwrap();
        store
            .append(&topic, HistoryMessage::assistant(MessageId::from("m1"), "hello"))
            .await
            .unwrap();

        let history = store.get_history(&topic).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let topic = TopicId::from("busy");
        let mut tasks = JoinSet::new();

        for i in 0..64 {
            let store = Arc::clone(&store);
            let topic = topic.clone();
            tasks.spawn(async move {
                store
                    .append(&topic, HistoryMessage::assistant(MessageId::new(), format!("{i}")))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.get_history(&topic).await.unwrap().len(), 64);
    }
}
