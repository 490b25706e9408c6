//! Consumers of a live voice session: the transcript sink and the responder.

use crate::transcriber::TranscribedMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives transcribed messages one at a time, in arrival order.
///
/// Called on the transcriber's notification thread; implementations must
/// not block.
pub trait TranscriptSink: Send + Sync {
    fn on_transcribed_message(&self, message: TranscribedMessage);
}

/// Work that runs for as long as the voice session is live.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Called once the transcriber has been launched.
    async fn start(&self) -> anyhow::Result<()>;

    /// Called on teardown.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// The pair of downstream consumers a voice connection drives.
#[derive(Clone)]
pub struct Downstream {
    pub transcript: Arc<dyn TranscriptSink>,
    pub responder: Arc<dyn Responder>,
}

impl Downstream {
    pub fn new(transcript: Arc<dyn TranscriptSink>, responder: Arc<dyn Responder>) -> Self {
        Self {
            transcript,
            responder,
        }
    }
}

/// Transcript sink that forwards messages into an unbounded channel.
#[derive(Debug, Clone)]
pub struct TranscriptChannel {
    tx: mpsc::UnboundedSender<TranscribedMessage>,
}

impl TranscriptChannel {
    /// Creates the sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TranscribedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TranscriptSink for TranscriptChannel {
    fn on_transcribed_message(&self, message: TranscribedMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("transcript receiver dropped; discarding message");
        }
    }
}
