//! Error types for the voice bridge.

use crate::transcriber::error::TranscriberError;
use crate::voice::identity::ChannelId;
use std::time::Duration;

/// Top-level error type for voice connection operations.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// `connect()` was called while the connection is live.
    #[error("already connected to voice channel {channel_id}")]
    AlreadyConnected {
        /// The channel the connection is currently bound to.
        channel_id: ChannelId,
    },

    /// The two handshake signals did not both arrive in time.
    #[error("couldn't connect to voice channel within {:.2}s", .timeout.as_secs_f64())]
    HandshakeTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The connection was torn down while the handshake was still in flight.
    #[error("voice handshake interrupted: {reason}")]
    HandshakeInterrupted {
        /// What tore the connection down.
        reason: String,
    },

    /// The gateway rejected or failed to deliver a voice-state request.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Transcription session error.
    #[error("transcriber error: {0}")]
    Transcriber(#[from] TranscriberError),

    /// Downstream responder failed to start.
    #[error("responder error: {0}")]
    Responder(String),

    /// The operation exists on the API surface but is not implemented.
    #[error("{operation} is not supported")]
    NotSupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
