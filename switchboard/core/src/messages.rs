//! Switchboard Messages
//!
//! The data model shared by every part of the core: identifiers, the inbound
//! [`Prompt`], the outbound [`ResponseFragment`], and the reconciled [`Turn`]
//! that viewers display.
//!
//! # Design Philosophy
//!
//! Fragments are never mutated once they leave the producer. Accumulation is
//! the consumer's job: the registry stores fragments as-is (stamping only the
//! sequence number when the producer left it unset), viewers concatenate them,
//! and the reconciler folds them into turns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Topic identifier
///
/// A topic is one conversation thread as seen by UI viewers. Every buffer,
/// subscription and history entry is keyed by it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(pub String);

impl TopicId {
    /// Create a topic ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Message identifier
///
/// Groups the fragments that belong to one logical reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of whoever sent a prompt
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub String);

impl SenderId {
    /// Create a sender ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Provenance
// ============================================================================

/// Which external source originated a prompt/response pair
///
/// Used purely as a map key by the router; it has no wire format of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Web UI over a persistent connection
    Ui,
    /// Queue-based external system
    Queue,
    /// Chat-bot platform API
    Bot,
    /// Local terminal
    Terminal,
}

impl Provenance {
    /// Every provenance, in declaration order
    pub const ALL: [Provenance; 4] = [Self::Ui, Self::Queue, Self::Bot, Self::Terminal];

    /// Stable lowercase name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Queue => "queue",
            Self::Bot => "bot",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unrecognised provenance name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provenance: {0}")]
pub struct UnknownProvenance(pub String);

impl FromStr for Provenance {
    type Err = UnknownProvenance;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProvenance(s.to_string()))
    }
}

// ============================================================================
// Topic Key
// ============================================================================

/// Transport-level address of a conversation
///
/// Each source client addresses conversations by its own chat/thread
/// identifiers. [`TopicKey::topic_id`] maps any key onto the UI-visible
/// topic so that every transport resolves the same topic for the same
/// conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    /// Source that owns this conversation
    pub provenance: Provenance,
    /// Transport chat identifier
    pub chat_id: String,
    /// Optional thread within the chat
    pub thread_id: Option<String>,
    /// Agent answering in this conversation
    pub agent_id: String,
}

impl TopicKey {
    /// Create a key without a thread
    pub fn new(provenance: Provenance, chat_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            provenance,
            chat_id: chat_id.into(),
            thread_id: None,
            agent_id: agent_id.into(),
        }
    }

    /// Set the thread identifier
    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Resolve the UI-visible topic for this conversation
    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        match &self.thread_id {
            Some(thread) => TopicId(format!("{}/{}/{}", self.agent_id, self.chat_id, thread)),
            None => TopicId(format!("{}/{}", self.agent_id, self.chat_id)),
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// One inbound user message
///
/// Created by a source client when external input arrives and consumed exactly
/// once by the conversation engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Conversation this prompt belongs to
    pub key: TopicKey,
    /// Prompt text
    pub text: String,
    /// Who sent it
    pub sender: SenderId,
    /// Message this prompt replies to, if any
    pub reply_to: Option<MessageId>,
    /// Source that produced it
    pub provenance: Provenance,
}

impl Prompt {
    /// Create a prompt; provenance is taken from the key
    pub fn new(key: TopicKey, sender: SenderId, text: impl Into<String>) -> Self {
        let provenance = key.provenance;
        Self {
            key,
            text: text.into(),
            sender,
            reply_to: None,
            provenance,
        }
    }

    /// Set the reply target
    #[must_use]
    pub fn with_reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// UI-visible topic of this prompt
    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        self.key.topic_id()
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// A tool invocation waiting for a human decision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Correlation id used to answer the request
    pub request_id: String,
    /// Tool the agent wants to run
    pub tool_name: String,
    /// Human-readable summary of the call
    pub summary: String,
}

impl ApprovalRequest {
    /// Create a request with a fresh correlation id
    pub fn new(tool_name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            summary: summary.into(),
        }
    }
}

/// One increment of a streaming reply
///
/// A fragment carrying `sender` and no `message_id` is a user-message fragment:
/// the prompt itself, echoed into the stream so late viewers see it in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFragment {
    /// Topic this fragment belongs to
    pub topic: TopicId,
    /// Logical reply this fragment is part of
    pub message_id: Option<MessageId>,
    /// Sender of a user-message fragment
    pub sender: Option<SenderId>,
    /// Text delta
    pub text: String,
    /// Reasoning delta
    pub reasoning: String,
    /// Tool-call descriptor delta
    pub tool_calls: String,
    /// Whether this fragment completes its reply
    pub is_complete: bool,
    /// Embedded approval request
    pub approval: Option<ApprovalRequest>,
    /// Position within the topic (0 = not yet sequenced)
    pub sequence: u64,
}

impl ResponseFragment {
    /// Text delta for an assistant reply
    pub fn text(topic: TopicId, message_id: MessageId, text: impl Into<String>) -> Self {
        Self {
            topic,
            message_id: Some(message_id),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Reasoning delta for an assistant reply
    pub fn reasoning(topic: TopicId, message_id: MessageId, reasoning: impl Into<String>) -> Self {
        Self {
            topic,
            message_id: Some(message_id),
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }

    /// Tool-call descriptor delta for an assistant reply
    pub fn tool_call(topic: TopicId, message_id: MessageId, descriptor: impl Into<String>) -> Self {
        Self {
            topic,
            message_id: Some(message_id),
            tool_calls: descriptor.into(),
            ..Default::default()
        }
    }

    /// Content-free completion marker
    pub fn completion(topic: TopicId, message_id: MessageId) -> Self {
        Self {
            topic,
            message_id: Some(message_id),
            is_complete: true,
            ..Default::default()
        }
    }

    /// The user's own message, echoed into the stream
    pub fn user_message(topic: TopicId, sender: SenderId, text: impl Into<String>) -> Self {
        Self {
            topic,
            sender: Some(sender),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Mark this fragment as completing its reply
    #[must_use]
    pub fn completed(mut self) -> Self {
        self.is_complete = true;
        self
    }

    /// Attach an approval request
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalRequest) -> Self {
        self.approval = Some(approval);
        self
    }

    /// Pre-assign a sequence number
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Whether this is a user-message fragment
    #[must_use]
    pub fn is_user_message(&self) -> bool {
        self.sender.is_some() && self.message_id.is_none()
    }

    /// Whether the fragment carries any displayable delta
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.reasoning.is_empty() || !self.tool_calls.is_empty()
    }
}

/// One outbound update as it travels from the engine to the sinks
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseUpdate {
    /// Conversation the update belongs to (carries provenance)
    pub key: TopicKey,
    /// The fragment
    pub fragment: ResponseFragment,
    /// Raw engine payload, passed through untouched
    pub raw: Option<serde_json::Value>,
}

impl ResponseUpdate {
    /// Create an update without a raw payload
    pub fn new(key: TopicKey, fragment: ResponseFragment) -> Self {
        Self {
            key,
            fragment,
            raw: None,
        }
    }

    /// Attach the raw engine payload
    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// UI-visible topic of this update
    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        self.key.topic_id()
    }
}

// ============================================================================
// Turns
// ============================================================================

/// Who authored a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageRole {
    /// User input
    User,
    /// Agent reply
    Assistant,
    /// System message
    System,
}

/// A reconciled, displayable unit of conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Author
    pub role: MessageRole,
    /// Accumulated text
    pub text: String,
    /// Accumulated reasoning
    pub reasoning: String,
    /// Accumulated tool-call descriptors
    pub tool_calls: String,
    /// Reply this turn was built from
    pub message_id: Option<MessageId>,
    /// Sender of a user turn
    pub sender: Option<SenderId>,
}

impl Turn {
    /// Empty assistant placeholder
    #[must_use]
    pub fn empty_assistant() -> Self {
        Self {
            role: MessageRole::Assistant,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: String::new(),
            message_id: None,
            sender: None,
        }
    }

    /// A user-authored turn
    pub fn user(sender: Option<SenderId>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            sender,
            ..Self::empty_assistant()
        }
    }

    /// A system turn (used for user-visible errors)
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            text: text.into(),
            ..Self::empty_assistant()
        }
    }

    /// No text, reasoning or tool calls
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }
}
