//! Source Clients
//!
//! Every transport that produces prompts and consumes responses implements
//! [`SourceClient`]. One variant exists per transport kind:
//!
//! - [`UiSourceClient`] - web UI viewers, via the [`UiHub`](crate::ui_hub::UiHub)
//! - [`QueueSourceClient`] - an external job queue
//! - [`BotSourceClient`] - a chat-bot platform
//! - [`TerminalSourceClient`] - a local terminal
//!
//! [`CompositeClient`] implements the same trait over any number of them.

mod bot;
mod channel;
mod composite;
mod queue;
mod terminal;
mod traits;
mod ui;

pub use bot::{BotReply, BotSourceClient};
pub use composite::{BroadcastResult, CompositeClient, CompositeConfig};
pub use queue::{QueueReply, QueueSourceClient};
pub use terminal::TerminalSourceClient;
pub use traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
pub use ui::UiSourceClient;
