//! Out-of-process audio transcription.
//!
//! A [`Transcriber`] joins the voice server on our behalf, listens to the
//! channel, and reports lifecycle events and recognized speech as
//! [`TranscriberNotification`]s. Notifications are delivered on the
//! transcriber's own thread, never on the caller's task: handlers must not
//! block on, or wait for, the transcriber from inside a notification.

pub mod error;
pub mod process;
pub mod protocol;

pub use error::TranscriberError;
pub use process::ProcessTranscriber;
pub use protocol::{TranscribedMessage, TranscriberNotification};

use crate::voice::identity::{ChannelId, GuildId, ServerEndpoint, UserId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every notification, on the notification thread.
pub type NotificationHandler = Arc<dyn Fn(TranscriberNotification) + Send + Sync>;

/// Everything the transcriber needs to join a voice session.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub channel_id: ChannelId,
    pub endpoint: ServerEndpoint,
    pub guild_id: GuildId,
    pub session_id: String,
    pub user_id: UserId,
    pub token: String,
}

impl fmt::Debug for LaunchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchParams")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// A transcription session that can be started and stopped repeatedly.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Start transcribing. Returns once the session is launched; the
    /// connection outcome arrives later as a notification.
    async fn run(
        &self,
        params: LaunchParams,
        on_notification: NotificationHandler,
    ) -> Result<(), TranscriberError>;

    /// Stop the session and wait for the notification thread to exit.
    ///
    /// Must not be called from inside a notification handler.
    async fn stop(&self) -> Result<(), TranscriberError>;

    /// Returns `true` while the session is alive.
    fn is_running(&self) -> bool;
}
