//! Channel plumbing shared by the in-process source clients.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use super::traits::ClientError;
use crate::messages::{MessageId, Prompt, ResponseFragment, TopicId};

/// Inbound prompt queue fed by the transport and drained once by `read_prompts`
#[derive(Debug)]
pub(crate) struct Inbox {
    tx: mpsc::Sender<Prompt>,
    rx: Mutex<Option<mpsc::Receiver<Prompt>>>,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Prompt> {
        self.tx.clone()
    }

    pub(crate) fn take(&self, client: &str) -> Result<mpsc::Receiver<Prompt>, ClientError> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| ClientError::Closed(format!("{client} prompts already taken")))
    }
}

/// How long an unfinished reply may sit idle before it is given up on
pub(crate) const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// Ticker for sweeping idle replies, first tick immediate
pub(crate) fn idle_ticker(timeout: Duration) -> Interval {
    let mut ticker = tokio::time::interval(timeout.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[derive(Debug)]
struct PendingReply {
    text: String,
    touched: Instant,
}

/// Accumulates text deltas per reply until the reply completes
///
/// A reply that never completes (cancelled, swept, or its completion
/// dropped on a full channel) is discarded when a newer reply starts on the
/// same topic, or when it has been idle longer than the reply timeout.
#[derive(Debug, Default)]
pub(crate) struct ReplyAccumulator {
    pending: HashMap<(TopicId, Option<MessageId>), PendingReply>,
}

impl ReplyAccumulator {
    /// Feed one fragment; returns the full text once its reply completes
    ///
    /// User-message fragments and replies without any text yield nothing.
    pub(crate) fn push(&mut self, topic: &TopicId, fragment: &ResponseFragment) -> Option<String> {
        if fragment.is_user_message() {
            return None;
        }

        let key = (topic.clone(), fragment.message_id.clone());
        if !self.pending.contains_key(&key) {
            self.abandon_others(&key);
        }
        if !fragment.text.is_empty() {
            let reply = self.pending.entry(key.clone()).or_insert_with(|| PendingReply {
                text: String::new(),
                touched: Instant::now(),
            });
            reply.text.push_str(&fragment.text);
            reply.touched = Instant::now();
        }

        if fragment.is_complete {
            self.pending
                .remove(&key)
                .map(|reply| reply.text)
                .filter(|text| !text.is_empty())
        } else {
            None
        }
    }

    /// Drop unfinished replies of the same topic that `key` supersedes
    fn abandon_others(&mut self, key: &(TopicId, Option<MessageId>)) {
        let before = self.pending.len();
        self.pending
            .retain(|(topic, message_id), _| topic != &key.0 || message_id == &key.1);
        let abandoned = before - self.pending.len();
        if abandoned > 0 {
            debug!(topic = %key.0, abandoned, "Unfinished reply superseded");
        }
    }

    /// Drop replies idle for longer than `timeout` as of `now`
    pub(crate) fn evict_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, reply| now.saturating_duration_since(reply.touched) <= timeout);
        before - self.pending.len()
    }

    /// Replies still accumulating
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
