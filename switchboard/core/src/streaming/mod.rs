//! Resumable Response Streaming
//!
//! Every topic with a response in flight owns one [`StreamBuffer`]. The
//! [`StreamManager`] is the registry of those buffers: it sequences incoming
//! fragments, tracks the producer's lifecycle, hands out atomic
//! snapshot-plus-subscription pairs for reconnecting viewers, and sweeps
//! buffers whose producer vanished.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        StreamManager                            │
//! │  DashMap<TopicId, Arc<TopicStream>>                             │
//! │  ┌──────────────────────┐  ┌──────────────────────┐            │
//! │  │ TopicStream (A)      │  │ TopicStream (B)      │   ...      │
//! │  │  Mutex {             │  │  Mutex {             │            │
//! │  │    StreamBuffer      │  │    StreamBuffer      │            │
//! │  │    live subscribers  │  │    live subscribers  │            │
//! │  │  }                   │  │  }                   │            │
//! │  └──────────┬───────────┘  └──────────┬───────────┘            │
//! │             │ append / complete / cancel                        │
//! │             ▼                                                   │
//! │   LiveEvent::{Fragment, Completed, Cancelled} → subscribers     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks are per topic and never held across an `.await`, so a slow or
//! stalled topic cannot hold up any other.
//!
//! # Example
//!
//! ```ignore
//! use switchboard_core::streaming::StreamManager;
//!
//! let manager = StreamManager::new();
//! let handle = manager.get_or_create(topic.clone(), "chat", None);
//! handle.append(fragment);
//!
//! let (snapshot, mut live) = manager.snapshot_and_subscribe(&topic).unwrap();
//! while let Some(event) = live.recv().await { /* ... */ }
//! ```

mod stream_buffer;
mod stream_manager;

pub use stream_buffer::{
    AppendOutcome, BufferOverflowPolicy, BufferStats, StreamBuffer, StreamSnapshot,
};
pub use stream_manager::{
    BufferHandle, LiveEvent, LiveSubscription, ProducerGuard, StreamManager, StreamManagerConfig,
};
