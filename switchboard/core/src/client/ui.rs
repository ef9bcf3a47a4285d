//! UI source client
//!
//! Prompts typed into the web UI arrive through [`UiSourceClient::prompt_sender`];
//! every outbound fragment is pushed to the connected viewers through the
//! [`UiHub`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::channel::Inbox;
use super::traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
use crate::messages::{Prompt, Provenance, TopicKey};
use crate::ui_hub::UiHub;

/// Source client for the web UI
#[derive(Debug)]
pub struct UiSourceClient {
    hub: UiHub,
    inbox: Inbox,
}

impl UiSourceClient {
    /// Create a client pushing to `hub`, buffering up to `capacity` inbound prompts
    #[must_use]
    pub fn new(hub: UiHub, capacity: usize) -> Self {
        Self {
            hub,
            inbox: Inbox::new(capacity),
        }
    }

    /// Where the web layer submits prompts
    #[must_use]
    pub fn prompt_sender(&self) -> tokio::sync::mpsc::Sender<Prompt> {
        self.inbox.sender()
    }

    /// The viewer hub
    #[must_use]
    pub fn hub(&self) -> &UiHub {
        &self.hub
    }
}

#[async_trait]
impl SourceClient for UiSourceClient {
    fn name(&self) -> &str {
        "ui"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Ui
    }

    async fn read_prompts(
        &self,
        _poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError> {
        let rx = self.inbox.take(self.name())?;
        Ok(ReceiverStream::new(rx)
            .map(Ok)
            .take_until(cancel.cancelled_owned())
            .boxed())
    }

    async fn process_response_stream(
        &self,
        mut updates: UpdateStream,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        loop {
            let update = tokio::select! {
                () = cancel.cancelled() => break,
                next = updates.next() => match next {
                    Some(update) => update,
                    None => break,
                },
            };

            let result = self.hub.publish_fragment(update.fragment);
            if !result.all_succeeded() {
                let removed = self.hub.cleanup_disconnected();
                debug!(failed = result.failed, removed, "Some viewers missed a fragment");
            }
        }
        Ok(())
    }

    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        _cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError> {
        Ok(request.key())
    }
}
