//! Viewer Monitor
//!
//! A built-in UI viewer that logs what a web client would see. Whenever a
//! stream starts it follows the topic through the resume coordinator, the
//! same path a reconnecting browser takes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use switchboard_core::{
    StreamNotification, StreamResumeCoordinator, TopicId, UiHub, UiMessage, ViewEvent,
};

/// Connect a monitoring viewer to `hub` until `cancel` fires
pub fn spawn_monitor(
    hub: &UiHub,
    coordinator: Arc<StreamResumeCoordinator>,
    capacity: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (viewer, mut messages) = hub.connect(capacity);
    let hub = hub.clone();

    tokio::spawn(async move {
        let mut followers = JoinSet::new();

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                UiMessage::Notification(StreamNotification::StreamStarted { topic }) => {
                    followers.spawn(follow(
                        Arc::clone(&coordinator),
                        topic,
                        cancel.child_token(),
                    ));
                }
                UiMessage::Notification(notification) => {
                    debug!(topic = %notification.topic(), ?notification, "Stream notification");
                }
                UiMessage::Fragment(fragment) => {
                    trace!(topic = %fragment.topic, sequence = fragment.sequence, "Fragment");
                }
            }

            while let Some(joined) = followers.try_join_next() {
                if let Err(error) = joined {
                    warn!(%error, "Stream follower panicked");
                }
            }
        }

        hub.disconnect(viewer);
        followers.shutdown().await;
        debug!("Viewer monitor stopped");
    })
}

/// Follow one topic to the end of its stream
async fn follow(coordinator: Arc<StreamResumeCoordinator>, topic: TopicId, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel(64);
    let resume = {
        let topic = topic.clone();
        async move {
            let outcome = coordinator.resume(&topic, &tx, cancel).await;
            drop(tx);
            outcome
        }
    };
    let count = async {
        let mut events = 0usize;
        while let Some(event) = rx.recv().await {
            if let ViewEvent::Error(turn) = &event {
                warn!(topic = %topic, error = %turn.text, "Resume reported an error");
            }
            events += 1;
        }
        events
    };

    let (outcome, events) = tokio::join!(resume, count);
    info!(topic = %topic, ?outcome, events, "Stream followed");
}
