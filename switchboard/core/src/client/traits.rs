//! Source Client Traits
//!
//! The contract every transport implements. A source client is both an
//! inbound source of prompts and an outbound sink for responses; the
//! [`CompositeClient`](super::CompositeClient) implements the same contract
//! over any number of them, so the rest of the system never knows whether
//! one or many transports are active.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::messages::{Prompt, Provenance, ResponseUpdate, TopicKey};

/// Errors raised by source clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The client's inbound or outbound side was already consumed or shut down
    #[error("client closed: {0}")]
    Closed(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// No inner client handles this provenance
    #[error("no client registered for provenance {0}")]
    NoClientFor(Provenance),

    /// Operation abandoned because its cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

/// Lazily produced inbound prompts
pub type PromptStream = BoxStream<'static, Result<Prompt, ClientError>>;

/// Outbound updates handed to a sink
pub type UpdateStream = BoxStream<'static, ResponseUpdate>;

/// Request to open (or reopen) a conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRequest {
    /// Source that owns the conversation
    pub provenance: Provenance,
    /// Transport chat identifier
    pub chat_id: String,
    /// Optional thread within the chat
    pub thread_id: Option<String>,
    /// Agent answering in the conversation
    pub agent_id: String,
    /// Display name
    pub name: String,
}

impl TopicRequest {
    /// Create a request without a thread
    pub fn new(
        provenance: Provenance,
        chat_id: impl Into<String>,
        agent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provenance,
            chat_id: chat_id.into(),
            thread_id: None,
            agent_id: agent_id.into(),
            name: name.into(),
        }
    }

    /// Set the thread identifier
    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// The key this request resolves to
    #[must_use]
    pub fn key(&self) -> TopicKey {
        let key = TopicKey::new(self.provenance, self.chat_id.clone(), self.agent_id.clone());
        match &self.thread_id {
            Some(thread) => key.with_thread(thread.clone()),
            None => key,
        }
    }
}

/// A transport that produces prompts and consumes responses
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Provenance of the prompts this client produces
    fn provenance(&self) -> Provenance;

    /// Start producing inbound prompts
    ///
    /// Called once for the life of the process. `poll_hint` is advisory for
    /// transports that poll. The stream ends when the transport closes or
    /// `cancel` fires.
    async fn read_prompts(
        &self,
        poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError>;

    /// Deliver outbound updates until the stream ends or `cancel` fires
    async fn process_response_stream(
        &self,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> Result<(), ClientError>;

    /// Open or reopen a conversation on this transport
    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError>;

    /// Whether this transport can deliver scheduled (unprompted) notifications
    fn supports_scheduled_notifications(&self) -> bool {
        false
    }
}
