//! Terminal source client
//!
//! Reads one prompt per non-empty input line and writes reply text to the
//! output as it streams. Generic over the reader and writer so the daemon
//! can hand it stdin/stdout and tests can hand it in-memory pipes.

use std::future::ready;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::traits::{ClientError, PromptStream, SourceClient, TopicRequest, UpdateStream};
use crate::messages::{Prompt, Provenance, SenderId, TopicKey};

/// Source client for a local terminal
pub struct TerminalSourceClient<R, W> {
    key: TopicKey,
    sender: SenderId,
    reader: Mutex<Option<R>>,
    writer: Mutex<Option<W>>,
}

impl<R, W> TerminalSourceClient<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a client talking to `agent_id` as `sender`
    pub fn new(reader: R, writer: W, agent_id: impl Into<String>, sender: SenderId) -> Self {
        Self {
            key: TopicKey::new(Provenance::Terminal, "terminal", agent_id),
            sender,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Conversation this terminal talks in
    #[must_use]
    pub fn key(&self) -> &TopicKey {
        &self.key
    }
}

fn io_error(error: std::io::Error) -> ClientError {
    ClientError::Transport(error.to_string())
}

#[async_trait]
impl<R, W> SourceClient for TerminalSourceClient<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        "terminal"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Terminal
    }

    async fn read_prompts(
        &self,
        _poll_hint: Duration,
        cancel: CancellationToken,
    ) -> Result<PromptStream, ClientError> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| ClientError::Closed("terminal input already taken".to_string()))?;
        let key = self.key.clone();
        let sender = self.sender.clone();

        let lines = stream::unfold(reader.lines(), |mut lines| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), lines)),
                Ok(None) => None,
                Err(error) => Some((Err(io_error(error)), lines)),
            }
        });

        Ok(lines
            .filter_map(move |line| {
                let prompt = match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => Some(Ok(Prompt::new(key.clone(), sender.clone(), line.trim()))),
                    Err(error) => Some(Err(error)),
                };
                ready(prompt)
            })
            .take_until(cancel.cancelled_owned())
            .boxed())
    }

    async fn process_response_stream(
        &self,
        mut updates: UpdateStream,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| ClientError::Closed("terminal output already taken".to_string()))?;

        loop {
            let update = tokio::select! {
                () = cancel.cancelled() => break,
                next = updates.next() => match next {
                    Some(update) => update,
                    None => break,
                },
            };

            let fragment = update.fragment;
            if fragment.is_user_message() {
                continue;
            }
            if !fragment.text.is_empty() {
                writer
                    .write_all(fragment.text.as_bytes())
                    .await
                    .map_err(io_error)?;
            }
            if fragment.is_complete {
                writer.write_all(b"\n").await.map_err(io_error)?;
            }
            writer.flush().await.map_err(io_error)?;
        }

        writer.flush().await.map_err(io_error)
    }

    async fn create_or_resume_topic(
        &self,
        request: &TopicRequest,
        _cancel: CancellationToken,
    ) -> Result<TopicKey, ClientError> {
        Ok(request.key())
    }
}

impl<R, W> std::fmt::Debug for TerminalSourceClient<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSourceClient")
            .field("key", &self.key)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}
