//! Chaos Tests for Stream Buffer Resilience
//!
//! These tests verify registry behavior under adverse conditions:
//! - Many tasks racing to create and write one topic
//! - Writes arriving after completion
//! - Producers that vanish without completing
//! - Cleanup racing with live writers and subscribers

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use switchboard_core::{
    LiveEvent, MessageId, ResponseFragment, StreamManager, StreamManagerConfig, TopicId,
};

fn topic(name: &str) -> TopicId {
    TopicId::from(name)
}

fn fragment(topic: &TopicId, text: String) -> ResponseFragment {
    ResponseFragment::text(topic.clone(), MessageId::from("m1"), text)
}

// =============================================================================
// Creation races
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_create_yields_one_buffer() {
    const WRITERS: usize = 16;
    const PER_WRITER: usize = 50;

    let streams = Arc::new(StreamManager::new());
    let t = topic("agent/race");
    let mut set = JoinSet::new();

    for writer in 0..WRITERS {
        let streams = Arc::clone(&streams);
        let t = t.clone();
        set.spawn(async move {
            let handle = streams.get_or_create(t.clone(), "race", None);
            for n in 0..PER_WRITER {
                assert!(handle
                    .append(fragment(&t, format!("{writer}:{n}")))
                    .is_appended());
                tokio::task::yield_now().await;
            }
            handle
        });
    }

    let mut handles = Vec::new();
    while let Some(joined) = set.join_next().await {
        handles.push(joined.unwrap());
    }

    assert_eq!(streams.total_buffers_created(), 1);
    assert!(handles.windows(2).all(|pair| pair[0].same_buffer(&pair[1])));

    let snapshot = streams.snapshot(&t).unwrap();
    assert_eq!(snapshot.fragments.len(), WRITERS * PER_WRITER);

    let sequences: Vec<u64> = snapshot.fragments.iter().map(|f| f.sequence).collect();
    let expected: Vec<u64> = (1..=(WRITERS * PER_WRITER) as u64).collect();
    assert_eq!(sequences, expected);

    let distinct: HashSet<&str> = snapshot.fragments.iter().map(|f| f.text.as_str()).collect();
    assert_eq!(distinct.len(), WRITERS * PER_WRITER);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_many_topics_in_parallel() {
    let streams = Arc::new(StreamManager::new());
    let mut set = JoinSet::new();

    for n in 0..64 {
        let streams = Arc::clone(&streams);
        set.spawn(async move {
            let t = topic(&format!("agent/topic-{n}"));
            let handle = streams.get_or_create(t.clone(), "parallel", None);
            handle.append(fragment(&t, "hello".to_string()));
            streams.mark_completed(&t)
        });
    }

    while let Some(joined) = set.join_next().await {
        assert!(joined.unwrap());
    }
    assert_eq!(streams.active_count(), 64);
    assert_eq!(streams.total_fragments_appended(), 64);
}

// =============================================================================
// Completion
// =============================================================================

#[tokio::test]
async fn chaos_writes_after_completion_are_dropped() {
    let streams = StreamManager::new();
    let t = topic("agent/late");
    let handle = streams.get_or_create(t.clone(), "late", None);
    handle.append(fragment(&t, "final".to_string()));
    assert!(streams.mark_completed(&t));

    let before = streams.snapshot(&t).unwrap();
    for n in 0..10 {
        assert!(!streams.append(&t, fragment(&t, format!("late {n}"))));
        assert!(!handle.append(fragment(&t, format!("late handle {n}"))).is_appended());
    }
    let after = streams.snapshot(&t).unwrap();

    assert_eq!(before.fragments, after.fragments);
    assert_eq!(streams.dropped_late_writes(), 20);
}

// =============================================================================
// Orphans
// =============================================================================

#[tokio::test]
async fn chaos_abandoned_buffer_with_pending_prompt_is_swept() {
    let streams = StreamManager::with_config(StreamManagerConfig {
        orphan_grace: Duration::ZERO,
        ..StreamManagerConfig::default()
    });
    let t = topic("agent/abandoned");
    streams.get_or_create(t.clone(), "abandoned", None);
    assert!(streams.try_increment_pending(&t));
    streams.detach_producer(&t);

    let live = topic("agent/live");
    streams.get_or_create(live.clone(), "live", None);

    assert_eq!(streams.sweep_orphans(), 1);
    assert!(streams.snapshot(&t).is_none());
    assert!(streams.snapshot(&live).is_some());
}

#[tokio::test]
async fn chaos_background_sweeper_reclaims_orphans() {
    let streams = Arc::new(StreamManager::with_config(StreamManagerConfig {
        orphan_grace: Duration::ZERO,
        sweep_interval: Duration::from_millis(5),
        ..StreamManagerConfig::default()
    }));
    let cancel = CancellationToken::new();
    let sweeper = streams.spawn_orphan_sweeper(cancel.clone());

    let t = topic("agent/crashed");
    let handle = streams.get_or_create(t.clone(), "crashed", None);
    let producer_token = handle.cancellation_token();
    streams.detach_producer(&t);

    tokio::time::timeout(Duration::from_secs(5), async {
        while streams.contains(&t) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweeper removes the orphan");

    assert!(producer_token.is_cancelled());
    assert!(!handle.append(fragment(&t, "too late".to_string())).is_appended());

    cancel.cancel();
    sweeper.await.unwrap();
}

// =============================================================================
// Cleanup races
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_cleanup_during_writes_and_subscriptions() {
    let streams = Arc::new(StreamManager::new());
    let t = topic("agent/churn");
    let handle = streams.get_or_create(t.clone(), "churn", None);
    let (_, mut live) = streams.snapshot_and_subscribe(&t).unwrap();

    let writer = {
        let handle = handle.clone();
        let t = t.clone();
        tokio::spawn(async move {
            let mut appended = 0u64;
            for n in 0..1_000 {
                if handle.append(fragment(&t, n.to_string())).is_appended() {
                    appended += 1;
                }
                tokio::task::yield_now().await;
            }
            appended
        })
    };

    tokio::task::yield_now().await;
    assert!(streams.cleanup(&t));
    let appended = writer.await.unwrap();

    let mut received = 0u64;
    while let Some(event) = live.recv().await {
        if matches!(event, LiveEvent::Fragment(_)) {
            received += 1;
        }
    }

    assert!(received <= appended);
    assert!(!streams.contains(&t));
    assert!(handle.cancellation_token().is_cancelled());
}
