//! The chat gateway as seen by a voice connection.
//!
//! The gateway client itself lives outside this module: a voice connection
//! only sends voice-state change requests through [`VoiceGateway`] and
//! receives the two voice update payloads defined here.

use super::identity::{ChannelId, GuildId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request to join, move between, or leave voice channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceStateRequest {
    pub guild_id: GuildId,
    /// Target channel; `None` leaves voice.
    pub channel_id: Option<ChannelId>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

impl VoiceStateRequest {
    pub fn join(guild_id: GuildId, channel_id: ChannelId, self_deaf: bool, self_mute: bool) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_deaf,
            self_mute,
        }
    }

    pub fn leave(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_deaf: false,
            self_mute: false,
        }
    }
}

/// `VOICE_STATE_UPDATE` payload for our own user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub session_id: String,
    /// `None` when the server removed us from voice.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// `VOICE_SERVER_UPDATE` payload.
///
/// Endpoint and token may both be absent while the server allocates a voice
/// node; a later update carries them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    #[serde(default)]
    pub token: Option<String>,
    pub guild_id: GuildId,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// What the gateway's channel cache knows about a channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLookup {
    /// A voice-capable channel in the expected guild.
    Voice,
    /// A channel that exists but cannot carry voice.
    NotVoice,
    /// Not in the cache for this guild.
    Unknown,
}

/// Gateway operations a voice connection depends on.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Ask the gateway to change our voice state.
    async fn change_voice_state(&self, request: VoiceStateRequest) -> anyhow::Result<()>;

    /// Look up a channel in the gateway's cache.
    fn lookup_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> ChannelLookup;

    /// The bot's own user id.
    fn current_user_id(&self) -> UserId;
}
