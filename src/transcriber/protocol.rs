//! Notification protocol spoken by the transcriber.
//!
//! The transcriber writes one JSON object per line to stdout, externally
//! tagged by notification kind:
//!
//! ```json
//! {"Connect":{"channel_id":"42","guild_id":"7","session_id":"abc"}}
//! {"UserJoin":{"user_id":"1001","ssrc":12}}
//! {"TranscribedMessage":{"user_id":"1001","text":"hello there","timestamp_ms":1700000000000}}
//! {"Disconnect":{"kind":"runtime","reason":"connection lost"}}
//! ```
//!
//! A bare string (`"Reconnect"`) is accepted as a kind with an empty payload.
//! Kinds this crate does not know about decode to
//! [`TranscriberNotification::Unrecognized`] so newer transcribers keep
//! working; a known kind with a malformed payload is a protocol error.

use super::error::TranscriberError;
use crate::voice::identity::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};

/// Payload of `Connect` and `Reconnect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Voice server the transcriber ended up on.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub ssrc: Option<u32>,
}

/// Payload of `Disconnect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectInfo {
    /// Which phase dropped: `connect`, `reconnect` or `runtime`.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl DisconnectInfo {
    /// Synthesized when the transcriber's stdout closes without a
    /// disconnect notification.
    pub fn process_exited() -> Self {
        Self {
            kind: Some("runtime".to_owned()),
            reason: Some("process exited".to_owned()),
            ..Self::default()
        }
    }
}

/// Payload of `UserJoin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoinInfo {
    pub user_id: UserId,
    #[serde(default)]
    pub ssrc: Option<u32>,
}

/// One recognized utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribedMessage {
    /// Who spoke.
    pub user_id: UserId,
    /// Recognized text.
    pub text: String,
    /// Capture time, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
}

/// A notification from the transcriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriberNotification {
    Connect(ConnectInfo),
    Reconnect(ConnectInfo),
    Disconnect(DisconnectInfo),
    UserJoin(UserJoinInfo),
    TranscribedMessage(TranscribedMessage),
    /// A kind this crate does not handle.
    Unrecognized {
        /// The tag as sent.
        kind: String,
    },
}

impl TranscriberNotification {
    /// Wire tag of this notification.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connect(_) => "Connect",
            Self::Reconnect(_) => "Reconnect",
            Self::Disconnect(_) => "Disconnect",
            Self::UserJoin(_) => "UserJoin",
            Self::TranscribedMessage(_) => "TranscribedMessage",
            Self::Unrecognized { kind } => kind,
        }
    }
}

// Wire shape of the known kinds.
#[derive(Deserialize)]
enum WireNotification {
    Connect(ConnectInfo),
    Reconnect(ConnectInfo),
    Disconnect(DisconnectInfo),
    UserJoin(UserJoinInfo),
    TranscribedMessage(TranscribedMessage),
}

const KNOWN_KINDS: &[&str] = &[
    "Connect",
    "Reconnect",
    "Disconnect",
    "UserJoin",
    "TranscribedMessage",
];

impl From<WireNotification> for TranscriberNotification {
    fn from(wire: WireNotification) -> Self {
        match wire {
            WireNotification::Connect(info) => Self::Connect(info),
            WireNotification::Reconnect(info) => Self::Reconnect(info),
            WireNotification::Disconnect(info) => Self::Disconnect(info),
            WireNotification::UserJoin(info) => Self::UserJoin(info),
            WireNotification::TranscribedMessage(message) => Self::TranscribedMessage(message),
        }
    }
}

/// Parses one stdout line into a notification.
pub fn parse_notification(line: &str) -> Result<TranscriberNotification, TranscriberError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(TranscriberError::ProtocolError {
            message: "empty notification line".to_owned(),
        });
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;

    let (kind, payload) = match value {
        serde_json::Value::String(kind) => (kind, serde_json::json!({})),
        serde_json::Value::Object(map) if map.len() == 1 => {
            let Some(entry) = map.into_iter().next() else {
                return Err(TranscriberError::ProtocolError {
                    message: "empty notification object".to_owned(),
                });
            };
            entry
        }
        other => {
            return Err(TranscriberError::ProtocolError {
                message: format!("expected a single-key object, got {other}"),
            });
        }
    };

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Ok(TranscriberNotification::Unrecognized { kind });
    }

    let payload = if payload.is_null() {
        serde_json::json!({})
    } else {
        payload
    };
    let mut tagged = serde_json::Map::new();
    tagged.insert(kind.clone(), payload);

    let wire: WireNotification = serde_json::from_value(serde_json::Value::Object(tagged))
        .map_err(|e| TranscriberError::ProtocolError {
            message: format!("malformed {kind} notification: {e}"),
        })?;
    Ok(wire.into())
}
