//! Stream Buffer Implementation
//!
//! Per-topic transient state: the fragments produced since the buffer was
//! created, plus the bookkeeping a reconnecting viewer needs to rebuild its
//! view. A buffer is never persisted; it is rebuilt from history plus the
//! live stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::messages::{ResponseFragment, SenderId, TopicId};

// ============================================================================
// Configuration
// ============================================================================

/// Policy for handling a full buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferOverflowPolicy {
    /// Evict the oldest fragments (default, keeps the live tail intact)
    #[default]
    DropOldest,
    /// Refuse new fragments once full (keeps the head intact)
    DropNewest,
}

// ============================================================================
// Append Outcome
// ============================================================================

/// Result of appending one fragment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Fragment stored under `sequence`
    Appended {
        /// Sequence number the fragment was stored under
        sequence: u64,
        /// Fragments evicted to make room
        evicted: usize,
    },
    /// Producer already completed; fragment dropped
    LateWrite,
    /// Pre-sequenced fragment did not advance the sequence; fragment dropped
    OutOfOrder {
        /// Last accepted sequence
        last: u64,
        /// Sequence carried by the rejected fragment
        got: u64,
    },
    /// Buffer full under [`BufferOverflowPolicy::DropNewest`]; fragment dropped
    Full,
}

impl AppendOutcome {
    /// Whether the fragment was stored
    #[must_use]
    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended { .. })
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of a buffer, used by resume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSnapshot {
    /// Topic the buffer belongs to
    pub topic: TopicId,
    /// Display name given at creation
    pub name: String,
    /// Buffered fragments in sequence order
    pub fragments: Vec<ResponseFragment>,
    /// Whether a producer is still streaming into the buffer
    pub producer_active: bool,
    /// Whether the producer signalled completion
    pub completed: bool,
    /// Prompt currently being answered
    pub current_prompt: String,
    /// Sender of that prompt
    pub current_sender: Option<SenderId>,
    /// Prompts queued but not yet answered
    pub pending: u32,
    /// Last sequence number handed out
    pub last_sequence: u64,
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for one buffer
#[derive(Clone, Debug)]
pub struct BufferStats {
    /// Fragments accepted
    pub fragments_appended: u64,
    /// Fragments evicted by the overflow policy
    pub fragments_evicted: u64,
    /// Fragments dropped because the producer had completed
    pub late_writes_dropped: u64,
    /// When the buffer was created
    pub started_at: Instant,
    /// Last time anything touched the buffer
    pub last_activity: Instant,
}

// ============================================================================
// Stream Buffer
// ============================================================================

/// Buffered state for one topic
///
/// Not synchronised on its own; the registry wraps it in a per-topic lock.
#[derive(Debug)]
pub struct StreamBuffer {
    topic: TopicId,
    name: String,
    fragments: VecDeque<ResponseFragment>,
    last_sequence: u64,
    producer_active: bool,
    completed: bool,
    current_prompt: String,
    current_sender: Option<SenderId>,
    pending: u32,
    cancel: CancellationToken,
    max_fragments: usize,
    overflow_policy: BufferOverflowPolicy,
    stats: BufferStats,
}

impl StreamBuffer {
    /// Create an empty buffer with an active producer
    #[must_use]
    pub fn new(
        topic: TopicId,
        name: impl Into<String>,
        initial_sender: Option<SenderId>,
        max_fragments: usize,
        overflow_policy: BufferOverflowPolicy,
    ) -> Self {
        let now = Instant::now();
        Self {
            topic,
            name: name.into(),
            fragments: VecDeque::new(),
            last_sequence: 0,
            producer_active: true,
            completed: false,
            current_prompt: String::new(),
            current_sender: initial_sender,
            pending: 0,
            cancel: CancellationToken::new(),
            max_fragments: max_fragments.max(1),
            overflow_policy,
            stats: BufferStats {
                fragments_appended: 0,
                fragments_evicted: 0,
                late_writes_dropped: 0,
                started_at: now,
                last_activity: now,
            },
        }
    }

    /// Topic this buffer belongs to
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Display name given at creation
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of buffered fragments
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Whether no fragments are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Whether the producer signalled completion
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether a producer is still attached
    #[must_use]
    pub fn is_producer_active(&self) -> bool {
        self.producer_active
    }

    /// Prompts queued but not yet answered
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Last sequence number handed out
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Cancellation handle for this topic's producer
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Buffer statistics
    #[must_use]
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    fn touch(&mut self) {
        self.stats.last_activity = Instant::now();
    }

    /// Append a fragment
    ///
    /// Unsequenced fragments (`sequence == 0`) are stamped with the next
    /// number. Pre-sequenced fragments must be strictly greater than the
    /// last accepted one.
    pub fn append(&mut self, mut fragment: ResponseFragment) -> AppendOutcome {
        if self.completed {
            self.stats.late_writes_dropped += 1;
            return AppendOutcome::LateWrite;
        }

        let sequence = if fragment.sequence == 0 {
            self.last_sequence + 1
        } else if fragment.sequence > self.last_sequence {
            fragment.sequence
        } else {
            return AppendOutcome::OutOfOrder {
                last: self.last_sequence,
                got: fragment.sequence,
            };
        };

        let mut evicted = 0;
        if self.fragments.len() >= self.max_fragments {
            match self.overflow_policy {
                BufferOverflowPolicy::DropOldest => {
                    while self.fragments.len() >= self.max_fragments {
                        self.fragments.pop_front();
                        evicted += 1;
                    }
                    self.stats.fragments_evicted += evicted as u64;
                }
                BufferOverflowPolicy::DropNewest => return AppendOutcome::Full,
            }
        }

        fragment.sequence = sequence;
        self.last_sequence = sequence;
        self.fragments.push_back(fragment);
        self.stats.fragments_appended += 1;
        self.touch();

        AppendOutcome::Appended { sequence, evicted }
    }

    /// Record the prompt currently being answered
    pub fn set_current_prompt(&mut self, text: impl Into<String>, sender: Option<SenderId>) {
        self.current_prompt = text.into();
        if sender.is_some() {
            self.current_sender = sender;
        }
        self.touch();
    }

    /// Count one more queued prompt
    pub fn increment_pending(&mut self) -> u32 {
        self.pending = self.pending.saturating_add(1);
        self.touch();
        self.pending
    }

    /// Count one answered prompt
    ///
    /// Returns `None` on underflow; the counter stays at zero.
    pub fn decrement_pending(&mut self) -> Option<u32> {
        self.touch();
        if self.pending == 0 {
            return None;
        }
        self.pending -= 1;
        Some(self.pending)
    }

    /// Mark the producer as finished
    ///
    /// Returns `false` if it had already completed.
    pub fn mark_completed(&mut self) -> bool {
        let first = !self.completed;
        self.completed = true;
        self.producer_active = false;
        self.touch();
        first
    }

    /// Re-attach a producer to a buffer that has not completed
    ///
    /// Returns `false` if the buffer already completed.
    pub fn attach_producer(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.producer_active = true;
        self.touch();
        true
    }

    /// Producer went away without signalling completion
    pub fn detach_producer(&mut self) {
        self.producer_active = false;
        self.touch();
    }

    /// Whether the sweeper may remove this buffer
    ///
    /// A buffer without an active producer is orphaned once it has been idle
    /// for `grace`. A buffer whose producer is still flagged active but has
    /// been silent for `stalled` is assumed to belong to a crashed producer.
    #[must_use]
    pub fn is_orphaned(&self, now: Instant, grace: Duration, stalled: Duration) -> bool {
        let idle = now.saturating_duration_since(self.stats.last_activity);
        if self.producer_active {
            idle >= stalled
        } else {
            idle >= grace
        }
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            topic: self.topic.clone(),
            name: self.name.clone(),
            fragments: self.fragments.iter().cloned().collect(),
            producer_active: self.producer_active,
            completed: self.completed,
            current_prompt: self.current_prompt.clone(),
            current_sender: self.current_sender.clone(),
            pending: self.pending,
            last_sequence: self.last_sequence,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
