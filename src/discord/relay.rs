//! Relays transcripts to the log and, optionally, a text channel.

use super::client::DiscordClient;
use crate::transcriber::TranscribedMessage;
use crate::voice::{ChannelId, Responder};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TranscriptRx = mpsc::UnboundedReceiver<TranscribedMessage>;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<TranscriptRx>,
}

#[derive(Default)]
struct RelayState {
    /// Parked here while no drain task is running.
    receiver: Option<TranscriptRx>,
    running: Option<Running>,
}

/// [`Responder`] that drains the transcript channel while a voice session
/// is live.
///
/// The drain task hands the receiver back when stopped, so the relay can be
/// started again for the next session.
pub struct TranscriptRelay {
    target: Option<(Arc<DiscordClient>, ChannelId)>,
    state: Mutex<RelayState>,
}

impl TranscriptRelay {
    /// `target` is the client and text channel to post to; `None` only logs.
    pub fn new(receiver: TranscriptRx, target: Option<(Arc<DiscordClient>, ChannelId)>) -> Self {
        Self {
            target,
            state: Mutex::new(RelayState {
                receiver: Some(receiver),
                running: None,
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }
}

#[async_trait]
impl Responder for TranscriptRelay {
    async fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            tracing::debug!("transcript relay already running");
            return Ok(());
        }
        let Some(receiver) = state.receiver.take() else {
            anyhow::bail!("transcript receiver was lost by a previous relay task");
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain(receiver, cancel.clone(), self.target.clone()));
        state.running = Some(Running { cancel, task });
        tracing::info!("transcript relay started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        let receiver = running.task.await?;
        state.receiver = Some(receiver);
        tracing::info!("transcript relay stopped");
        Ok(())
    }
}

/// Formats a transcript line as a user mention followed by the text.
pub fn format_transcript(message: &TranscribedMessage) -> String {
    format!("<@{}>: {}", message.user_id, message.text)
}

async fn drain(
    mut receiver: TranscriptRx,
    cancel: CancellationToken,
    target: Option<(Arc<DiscordClient>, ChannelId)>,
) -> TranscriptRx {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = receiver.recv() => {
                let Some(message) = message else {
                    tracing::debug!("transcript sink dropped; relay idle");
                    cancel.cancelled().await;
                    break;
                };
                tracing::info!(user_id = %message.user_id, text = %message.text, "transcript");
                let Some((client, channel_id)) = &target else {
                    continue;
                };
                let content = format_transcript(&message);
                match cancel.run_until_cancelled(client.post_message(*channel_id, &content)).await {
                    None => {
                        tracing::debug!(channel_id = %channel_id, "relay stopped during a transcript post");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(channel_id = %channel_id, error = %e, "failed to relay transcript");
                    }
                    Some(Ok(())) => {}
                }
            }
        }
    }
    receiver
}
