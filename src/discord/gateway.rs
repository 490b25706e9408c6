//! [`VoiceGateway`] backed by a Discord gateway websocket.
//!
//! Voice-state requests become op-4 frames on an outbound queue that
//! [`run_gateway_session`](super::client::run_gateway_session) writes to the
//! socket. Dispatches read from the socket are fed back through
//! [`DiscordVoiceGateway::observe_dispatch`], which keeps the channel cache
//! and bot user id current and decodes the voice events.

use crate::voice::{
    ChannelId, ChannelLookup, GuildId, UserId, VoiceGateway, VoiceServerUpdate, VoiceStateRequest,
    VoiceStateUpdate,
};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// `GUILD_VOICE`
const CHANNEL_TYPE_VOICE: u64 = 2;
/// `GUILD_STAGE_VOICE`
const CHANNEL_TYPE_STAGE: u64 = 13;

/// Events surfaced from the gateway to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The session is identified.
    Ready { user_id: UserId },
    /// A guild's channels are cached and voice requests for it can be sent.
    GuildAvailable { guild_id: GuildId },
    Voice(VoiceEvent),
}

/// Voice dispatches addressed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    State(VoiceStateUpdate),
    Server(VoiceServerUpdate),
}

#[derive(Debug, Clone, Copy)]
struct CachedChannel {
    guild_id: GuildId,
    kind: u64,
}

/// Voice side of a Discord gateway session.
pub struct DiscordVoiceGateway {
    outbound: mpsc::UnboundedSender<String>,
    channels: Mutex<HashMap<ChannelId, CachedChannel>>,
    ready_user_id: Mutex<Option<UserId>>,
    token_user_id: Option<UserId>,
}

impl DiscordVoiceGateway {
    /// Creates the gateway and the receiver for frames it queues.
    pub fn new(bot_token: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let gateway = Self {
            outbound,
            channels: Mutex::new(HashMap::new()),
            ready_user_id: Mutex::new(None),
            token_user_id: bot_user_id_from_token(bot_token),
        };
        (gateway, rx)
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, CachedChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ready_user_id(&self) -> Option<UserId> {
        *self
            .ready_user_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies one dispatch (`op` 0) and returns the event it produces, if any.
    pub fn observe_dispatch(&self, event_name: &str, data: &Value) -> Option<GatewayEvent> {
        match event_name {
            "READY" => {
                let user_id = data
                    .get("user")
                    .and_then(|u| u.get("id"))
                    .and_then(parse_snowflake)
                    .map(UserId)
                    .or(self.token_user_id)?;
                *self
                    .ready_user_id
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user_id);
                Some(GatewayEvent::Ready { user_id })
            }
            "GUILD_CREATE" => {
                let guild_id = GuildId(data.get("id").and_then(parse_snowflake)?);
                if let Some(channels) = data.get("channels").and_then(Value::as_array) {
                    let mut cache = self.channels();
                    for channel in channels {
                        cache_channel(&mut cache, channel, Some(guild_id));
                    }
                    tracing::debug!(guild_id = %guild_id, channels = channels.len(), "guild channels cached");
                }
                Some(GatewayEvent::GuildAvailable { guild_id })
            }
            "CHANNEL_CREATE" | "CHANNEL_UPDATE" => {
                cache_channel(&mut self.channels(), data, None);
                None
            }
            "CHANNEL_DELETE" => {
                if let Some(id) = data.get("id").and_then(parse_snowflake) {
                    self.channels().remove(&ChannelId(id));
                }
                None
            }
            "VOICE_STATE_UPDATE" => {
                let update: VoiceStateUpdate = match serde_json::from_value(data.clone()) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed VOICE_STATE_UPDATE");
                        return None;
                    }
                };
                // Other users' voice states are not ours to reconcile.
                if update.user_id.is_some() && update.user_id != Some(self.current_user_id()) {
                    return None;
                }
                Some(GatewayEvent::Voice(VoiceEvent::State(update)))
            }
            "VOICE_SERVER_UPDATE" => match serde_json::from_value(data.clone()) {
                Ok(update) => Some(GatewayEvent::Voice(VoiceEvent::Server(update))),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed VOICE_SERVER_UPDATE");
                    None
                }
            },
            _ => None,
        }
    }
}

#[async_trait]
impl VoiceGateway for DiscordVoiceGateway {
    async fn change_voice_state(&self, request: VoiceStateRequest) -> anyhow::Result<()> {
        tracing::debug!(
            guild_id = %request.guild_id,
            channel_id = ?request.channel_id.map(|c| c.get()),
            "queueing voice state update"
        );
        self.outbound
            .send(voice_state_frame(&request).to_string())
            .map_err(|_| anyhow::anyhow!("discord gateway session is not running"))
    }

    fn lookup_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> ChannelLookup {
        match self.channels().get(&channel_id) {
            Some(cached) if cached.guild_id != guild_id => ChannelLookup::Unknown,
            Some(cached) if is_voice_kind(cached.kind) => ChannelLookup::Voice,
            Some(_) => ChannelLookup::NotVoice,
            None => ChannelLookup::Unknown,
        }
    }

    fn current_user_id(&self) -> UserId {
        self.ready_user_id()
            .or(self.token_user_id)
            .unwrap_or(UserId(0))
    }
}

/// Builds the op-4 voice state frame for `request`.
pub fn voice_state_frame(request: &VoiceStateRequest) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": request.guild_id.to_string(),
            "channel_id": request.channel_id.map(|c| c.to_string()),
            "self_mute": request.self_mute,
            "self_deaf": request.self_deaf,
        }
    })
}

fn is_voice_kind(kind: u64) -> bool {
    kind == CHANNEL_TYPE_VOICE || kind == CHANNEL_TYPE_STAGE
}

fn cache_channel(
    cache: &mut HashMap<ChannelId, CachedChannel>,
    channel: &Value,
    guild_id: Option<GuildId>,
) {
    let Some(id) = channel.get("id").and_then(parse_snowflake) else {
        return;
    };
    // Channels inside GUILD_CREATE omit their own guild_id.
    let Some(guild_id) = channel
        .get("guild_id")
        .and_then(parse_snowflake)
        .map(GuildId)
        .or(guild_id)
    else {
        return;
    };
    let kind = channel.get("type").and_then(Value::as_u64).unwrap_or(0);
    cache.insert(ChannelId(id), CachedChannel { guild_id, kind });
}

fn parse_snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// The first segment of a bot token is the base64 of the bot's user id.
pub fn bot_user_id_from_token(token: &str) -> Option<UserId> {
    let first = token.split('.').next()?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(first.trim_end_matches('='))
        .ok()?;
    String::from_utf8(decoded).ok()?.parse().ok().map(UserId)
}
