//! Buffer Reconciliation
//!
//! Folds a topic's buffered fragments into displayable turns and strips the
//! parts that persisted history already holds.
//!
//! The buffer is an approximate, possibly overlapping tail of what history
//! has durably recorded: a history write can race a viewer's read of the
//! buffer. Concatenating naively would duplicate content on every reconnect,
//! so every assistant turn is compared against the known history texts and
//! only the genuinely new suffix is kept.
//!
//! # Grouping rules
//!
//! - Fragments sharing a message id form one group, in first-seen order.
//! - Each user-message fragment is its own group at its original position.
//! - A group is complete if any fragment carries the completion flag. A
//!   non-final group with content is complete at the boundary where a newer
//!   group starts.
//! - A non-final group holding only reasoning is merged into the next
//!   assistant group instead of surfacing as a turn of its own.

use std::collections::HashMap;

use crate::messages::{MessageId, MessageRole, ResponseFragment, SenderId, Turn};

/// Default separator between reasoning spans of different replies
pub const DEFAULT_REASONING_SEPARATOR: &str = "\n-----\n";

/// Reconciliation tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Inserted before a reply's reasoning when an earlier reply already reasoned
    pub reasoning_separator: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            reasoning_separator: DEFAULT_REASONING_SEPARATOR.to_string(),
        }
    }
}

/// Result of reconciling a buffer against history
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciledView {
    /// Finished turns, in chronological order
    pub completed: Vec<Turn>,
    /// The reply still in progress (empty assistant placeholder if none)
    pub streaming: Turn,
}

impl ReconciledView {
    /// Nothing completed, nothing streaming
    #[must_use]
    pub fn empty() -> Self {
        Self {
            completed: Vec::new(),
            streaming: Turn::empty_assistant(),
        }
    }
}

impl Default for ReconciledView {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Default)]
struct Group {
    message_id: Option<MessageId>,
    sender: Option<SenderId>,
    is_user: bool,
    text: String,
    reasoning: String,
    tool_calls: String,
    completed: bool,
}

impl Group {
    fn has_visible_content(&self) -> bool {
        !self.text.is_empty() || !self.tool_calls.is_empty()
    }

    fn is_empty(&self) -> bool {
        !self.has_visible_content() && self.reasoning.is_empty()
    }

    /// Prepend reasoning carried from an earlier reasoning-only group
    fn absorb(&mut self, carried: Group) {
        let mut reasoning = carried.reasoning;
        reasoning.push_str(&self.reasoning);
        self.reasoning = reasoning;
        if self.message_id.is_none() {
            self.message_id = carried.message_id;
        }
    }

    fn into_turn(self) -> Turn {
        Turn {
            role: if self.is_user {
                MessageRole::User
            } else {
                MessageRole::Assistant
            },
            text: self.text,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            message_id: self.message_id,
            sender: self.sender,
        }
    }
}

fn group_fragments(fragments: &[ResponseFragment], options: &ReconcileOptions) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<Option<MessageId>, usize> = HashMap::new();
    let mut reasoning_seen = false;

    for fragment in fragments {
        if fragment.is_user_message() {
            groups.push(Group {
                sender: fragment.sender.clone(),
                is_user: true,
                text: fragment.text.clone(),
                completed: true,
                ..Default::default()
            });
            continue;
        }

        let slot = *index
            .entry(fragment.message_id.clone())
            .or_insert_with(|| {
                groups.push(Group {
                    message_id: fragment.message_id.clone(),
                    ..Default::default()
                });
                groups.len() - 1
            });
        let group = &mut groups[slot];

        group.text.push_str(&fragment.text);

        if !fragment.reasoning.is_empty() {
            if group.reasoning.is_empty() && reasoning_seen {
                group.reasoning.push_str(&options.reasoning_separator);
            }
            group.reasoning.push_str(&fragment.reasoning);
            reasoning_seen = true;
        }

        if !fragment.tool_calls.is_empty() {
            if !group.tool_calls.is_empty() {
                group.tool_calls.push('\n');
            }
            group.tool_calls.push_str(&fragment.tool_calls);
        }

        group.completed |= fragment.is_complete;
    }

    groups
}

/// Rebuild the view with default options
#[must_use]
pub fn rebuild(fragments: &[ResponseFragment], known_history: &[String]) -> ReconciledView {
    rebuild_with(fragments, known_history, &ReconcileOptions::default())
}

/// Rebuild the view of a buffer
///
/// `known_history` holds the assistant texts already persisted for the topic.
#[must_use]
pub fn rebuild_with(
    fragments: &[ResponseFragment],
    known_history: &[String],
    options: &ReconcileOptions,
) -> ReconciledView {
    let groups = group_fragments(fragments, options);
    let last_assistant = groups.iter().rposition(|group| !group.is_user);

    let mut view = ReconciledView::empty();
    let mut carried: Option<Group> = None;

    for (position, mut group) in groups.into_iter().enumerate() {
        if group.is_user {
            view.completed.push(group.into_turn());
            continue;
        }

        if let Some(previous) = carried.take() {
            group.absorb(previous);
        }

        if Some(position) == last_assistant && !group.completed {
            view.streaming = strip_turn(group.into_turn(), known_history);
            continue;
        }

        if group.completed || group.has_visible_content() {
            let turn = strip_turn(group.into_turn(), known_history);
            if !turn.is_empty() {
                view.completed.push(turn);
            }
        } else if !group.is_empty() {
            carried = Some(group);
        }
    }

    view
}

fn strip_turn(mut turn: Turn, known_history: &[String]) -> Turn {
    if turn.role != MessageRole::User {
        turn.text = strip_known_content(&turn.text, known_history);
    }
    turn
}

/// Remove the part of `text` that history already holds
///
/// - If some known string starts with `text`, all of it is known: returns empty.
/// - Else if `text` extends known strings, the longest such prefix is removed
///   and the remainder left-trimmed.
/// - Otherwise `text` is returned unchanged.
#[must_use]
pub fn strip_known_content(text: &str, known_history: &[String]) -> String {
    if text.is_empty() || known_history.iter().any(|known| known.starts_with(text)) {
        return String::new();
    }

    known_history
        .iter()
        .filter(|known| !known.is_empty() && text.starts_with(known.as_str()))
        .max_by_key(|known| known.len())
        .map_or_else(
            || text.to_string(),
            |known| text[known.len()..].trim_start().to_string(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TopicId;
    use pretty_assertions::assert_eq;

    fn topic() -> TopicId {
        TopicId::from("t")
    }

    fn text(mid: &str, t: &str) -> ResponseFragment {
        ResponseFragment::text(topic(), MessageId::from(mid), t)
    }

    fn reasoning(mid: &str, r: &str) -> ResponseFragment {
        ResponseFragment::reasoning(topic(), MessageId::from(mid), r)
    }

    fn done(mid: &str) -> ResponseFragment {
        ResponseFragment::completion(topic(), MessageId::from(mid))
    }

    fn user(t: &str) -> ResponseFragment {
        ResponseFragment::user_message(topic(), SenderId::from("alice"), t)
    }

    fn known(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn completed_texts(view: &ReconciledView) -> Vec<&str> {
        view.completed.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn test_empty_buffer() {
        let view = rebuild(&[], &[]);
        assert_eq!(view, ReconciledView::empty());
        assert_eq!(view.streaming.role, MessageRole::Assistant);
    }

    #[test]
    fn test_completed_reply_accumulates() {
        let fragments = vec![text("m1", "Hello"), text("m1", " world"), done("m1")];
        let view = rebuild(&fragments, &[]);

        assert_eq!(completed_texts(&view), vec!["Hello world"]);
        assert_eq!(view.completed[0].message_id, Some(MessageId::from("m1")));
        assert_eq!(view.streaming.text, "");
    }

    #[test]
    fn test_fully_known_streaming_text_is_stripped() {
        let fragments = vec![text("m1", "Known content here")];
        let view = rebuild(&fragments, &known(&["Known content here"]));
        assert_eq!(view.streaming.text, "");
    }

    #[test]
    fn test_known_prefix_is_stripped() {
        let fragments = vec![text("m1", "Known new content")];
        let view = rebuild(&fragments, &known(&["Known"]));
        assert_eq!(view.streaming.text, "new content");
    }

    #[test]
    fn test_partial_buffer_of_known_text_is_stripped() {
        // Buffer holds only the start of a reply history already has in full
        let fragments = vec![text("m1", "Known con")];
        let view = rebuild(&fragments, &known(&["Known content here"]));
        assert_eq!(view.streaming.text, "");
    }

    #[test]
    fn test_longest_known_prefix_wins() {
        assert_eq!(
            strip_known_content("abc def ghi", &known(&["abc", "abc def"])),
            "ghi"
        );
        assert_eq!(strip_known_content("unrelated", &known(&["abc"])), "unrelated");
        assert_eq!(strip_known_content("", &known(&["abc"])), "");
    }

    #[test]
    fn test_completed_turn_fully_in_history_is_dropped() {
        let fragments = vec![
            text("m1", "Already saved"),
            done("m1"),
            text("m2", "Fresh"),
        ];
        let view = rebuild(&fragments, &known(&["Already saved"]));
        assert!(view.completed.is_empty());
        assert_eq!(view.streaming.text, "Fresh");
    }

    #[test]
    fn test_user_turns_interleave_in_place() {
        let fragments = vec![
            user("first question"),
            text("m1", "first answer"),
            done("m1"),
            user("second question"),
            text("m2", "second answer"),
            done("m2"),
        ];
        let view = rebuild(&fragments, &[]);

        assert_eq!(
            completed_texts(&view),
            vec!["first question", "first answer", "second question", "second answer"]
        );
        assert_eq!(view.completed[0].role, MessageRole::User);
        assert_eq!(view.completed[0].sender, Some(SenderId::from("alice")));
        assert_eq!(view.completed[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_user_turns_are_not_stripped() {
        let fragments = vec![user("hello"), text("m1", "hello there")];
        let view = rebuild(&fragments, &known(&["hello"]));
        assert_eq!(completed_texts(&view), vec!["hello"]);
        assert_eq!(view.streaming.text, "there");
    }

    #[test]
    fn test_group_order_follows_first_fragment() {
        let fragments = vec![
            text("m1", "one "),
            text("m2", "two"),
            text("m1", "more"),
            done("m1"),
            done("m2"),
        ];
        let view = rebuild(&fragments, &[]);
        assert_eq!(completed_texts(&view), vec!["one more", "two"]);
    }

    #[test]
    fn test_non_final_group_is_implicitly_complete() {
        let fragments = vec![text("m1", "earlier"), text("m2", "later")];
        let view = rebuild(&fragments, &[]);
        assert_eq!(completed_texts(&view), vec!["earlier"]);
        assert_eq!(view.streaming.text, "later");
    }

    #[test]
    fn test_reasoning_only_group_merges_forward() {
        let fragments = vec![reasoning("m1", "thinking"), text("m2", "answer")];
        let view = rebuild(&fragments, &[]);

        assert!(view.completed.is_empty());
        assert_eq!(view.streaming.text, "answer");
        assert_eq!(view.streaming.reasoning, "thinking");
    }

    #[test]
    fn test_trailing_reasoning_only_group_streams() {
        let fragments = vec![reasoning("m1", "thinking...")];
        let view = rebuild(&fragments, &[]);
        assert_eq!(view.streaming.reasoning, "thinking...");
        assert_eq!(view.streaming.text, "");
    }

    #[test]
    fn test_reasoning_separator_between_replies() {
        let fragments = vec![
            reasoning("m1", "first"),
            text("m1", "a"),
            done("m1"),
            reasoning("m2", "second"),
            reasoning("m2", " still"),
        ];
        let view = rebuild(&fragments, &[]);

        assert_eq!(view.completed[0].reasoning, "first");
        assert_eq!(view.streaming.reasoning, "\n-----\nsecond still");
    }

    #[test]
    fn test_custom_reasoning_separator() {
        let options = ReconcileOptions {
            reasoning_separator: " | ".to_string(),
        };
        let fragments = vec![reasoning("m1", "a"), text("m1", "x"), reasoning("m2", "b")];
        let view = rebuild_with(&fragments, &[], &options);
        assert_eq!(view.streaming.reasoning, " | b");
    }

    #[test]
    fn test_tool_calls_joined_by_newline() {
        let fragments = vec![
            ResponseFragment::tool_call(topic(), MessageId::from("m1"), "search(q)"),
            ResponseFragment::tool_call(topic(), MessageId::from("m1"), "open(url)"),
            done("m1"),
        ];
        let view = rebuild(&fragments, &[]);
        assert_eq!(view.completed[0].tool_calls, "search(q)\nopen(url)");
    }

    #[test]
    fn test_content_free_completed_group_is_dropped() {
        let fragments = vec![done("m1"), text("m2", "hi")];
        let view = rebuild(&fragments, &[]);
        assert!(view.completed.is_empty());
        assert_eq!(view.streaming.text, "hi");
    }

    #[test]
    fn test_no_known_text_reproduced_by_adjacent_turns() {
        let history = known(&["The answer is 42."]);
        let fragments = vec![
            text("m1", "The answer is 42."),
            done("m1"),
            text("m2", "The answer is 42. Anything else?"),
        ];
        let view = rebuild(&fragments, &history);

        let mut joined = completed_texts(&view).concat();
        joined.push_str(&view.streaming.text);
        assert!(!joined.contains("The answer is 42."));
        assert_eq!(view.streaming.text, "Anything else?");
    }
}
