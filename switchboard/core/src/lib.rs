//! Switchboard Core - Multi-source Prompt Routing and Resumable Streaming
//!
//! This crate connects any number of prompt sources (web UI, job queue,
//! chat bot, terminal) to one conversation engine, and keeps each topic's
//! in-flight reply buffered so a viewer that reconnects mid-stream can
//! rebuild exactly what it missed.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Source Clients                           │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌──────────┐            │
//! │  │   UI    │  │  Queue  │  │   Bot   │  │ Terminal │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬─────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                 Prompt (up)  ResponseUpdate (down)              │
//! └──────────────────────────┼─────────────────────────────────────┘
//!                            │
//! ┌──────────────────────────┼─────────────────────────────────────┐
//! │                   SWITCHBOARD CORE                              │
//! │  ┌───────────────────────┴──────────────────────────────────┐   │
//! │  │                   CompositeClient                         │   │
//! │  │   merge prompts ─── route by provenance ─── broadcast     │   │
//! │  └───────────────────────┬──────────────────────────────────┘   │
//! │  ┌───────────────┐  ┌────┴──────────┐  ┌────────────────────┐   │
//! │  │ StreamManager │──│ StreamBuffer  │  │ StreamResume-      │   │
//! │  │ (per topic)   │  │ (fragments)   │──│ Coordinator        │   │
//! │  └───────────────┘  └───────────────┘  │ + reconcile        │   │
//! │                                        └────────────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`CompositeClient`]: merges prompts and fans responses out to sinks
//! - [`StreamManager`]: one buffer per topic, with live subscriptions
//! - [`StreamResumeCoordinator`]: replays a buffer into a reconnecting view
//! - [`SourceClient`]: the contract every transport implements
//! - [`HistoryStore`]: the persistence collaborator
//!
//! # Module Overview
//!
//! - [`messages`]: identifiers, prompts, fragments and turns
//! - [`streaming`]: per-topic buffers and their registry
//! - [`reconcile`]: rebuilding turns from buffered fragments
//! - [`resume`]: resuming a topic into a viewer
//! - [`routing`]: which sinks receive which provenance
//! - [`client`]: the source clients and the composite over them
//! - [`ui_hub`]: connected UI viewers
//! - [`history`]: persisted conversation history
//! - [`notifications`]: topic lifecycle notifications
//! - [`config`]: TOML and environment configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod history;
pub mod messages;
pub mod notifications;
pub mod reconcile;
pub mod resume;
pub mod routing;
pub mod streaming;
pub mod ui_hub;

// Re-exports for convenience
pub use messages::{
    ApprovalRequest, MessageId, MessageRole, Prompt, Provenance, ResponseFragment, ResponseUpdate,
    SenderId, TopicId, TopicKey, Turn,
};

// Client exports
pub use client::{
    BotReply, BotSourceClient, BroadcastResult, ClientError, CompositeClient, CompositeConfig,
    PromptStream, QueueReply, QueueSourceClient, SourceClient, TerminalSourceClient, TopicRequest,
    UiSourceClient, UpdateStream,
};

// Streaming exports
pub use streaming::{
    AppendOutcome, BufferHandle, BufferOverflowPolicy, LiveEvent, LiveSubscription, ProducerGuard,
    StreamManager, StreamManagerConfig, StreamSnapshot,
};

// Resume exports
pub use reconcile::{ReconcileOptions, ReconciledView};
pub use resume::{ResumeConfig, ResumeOutcome, StreamResumeCoordinator, ViewEvent};

// Routing exports
pub use routing::{SourceRegistration, SourceRouter};

// History exports
pub use history::{HistoryError, HistoryMessage, HistoryStore, InMemoryHistoryStore};

// Notification exports
pub use notifications::{BroadcastNotifier, NoopNotifier, Notifier, StreamNotification};

// UI hub exports
pub use ui_hub::{HubBroadcastResult, UiHub, UiMessage, ViewerId};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, SwitchboardConfig, SwitchboardToml,
};
