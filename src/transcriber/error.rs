//! Error types for the transcription session.

/// Errors that can occur while running a transcription session.
#[derive(Debug, thiserror::Error)]
pub enum TranscriberError {
    /// `run()` was called while a session is already running.
    #[error("transcriber is already running")]
    AlreadyRunning,

    /// Failed to spawn the transcriber subprocess.
    #[error("failed to spawn transcriber process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// `stop()` was called from the thread that delivers notifications.
    ///
    /// Stopping joins that thread, so honoring the call would deadlock.
    #[error("transcriber cannot be stopped from its own notification thread")]
    StopFromNotificationContext,

    /// The notification threads did not exit after the process was killed.
    #[error("transcriber threads did not exit within {timeout_ms}ms")]
    StopTimeout {
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// The subprocess emitted something that is not a valid notification.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Description of the protocol violation.
        message: String,
    },

    /// A notification line exceeded the configured size bound.
    #[error("transcriber output line exceeded {max_bytes} bytes")]
    OutputTruncated {
        /// The maximum allowed line size.
        max_bytes: usize,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[source] serde_json::Error),
}

impl From<serde_json::Error> for TranscriberError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}
