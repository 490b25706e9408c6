//! Connection identity: the ids and credentials that name one voice session.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw snowflake value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserialize_snowflake(deserializer).map(Self)
            }
        }
    };
}

snowflake_id!(
    /// Discord guild (server) id.
    GuildId
);
snowflake_id!(
    /// Discord channel id.
    ChannelId
);
snowflake_id!(
    /// Discord user id.
    UserId
);

/// Snowflakes arrive as decimal strings from the gateway, but as plain
/// numbers from some producers (including the transcriber).
fn deserialize_snowflake<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid snowflake: {s:?}"))),
    }
}

/// Voice server endpoint as handed to the transcriber.
///
/// The gateway may deliver the endpoint with or without a `wss://` prefix;
/// the prefix is stripped because the transcriber adds its own scheme. The
/// port suffix is parsed out separately so the bare host is available, but
/// it is kept in the rendered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    host: String,
    port: Option<u16>,
}

impl ServerEndpoint {
    /// Host name without scheme or port.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port suffix, if the gateway supplied one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

/// Normalizes a raw voice-server endpoint.
pub fn normalize_endpoint(raw: &str) -> ServerEndpoint {
    let trimmed = raw.trim();
    let without_scheme = trimmed.strip_prefix("wss://").unwrap_or(trimmed);

    match without_scheme.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => ServerEndpoint {
                host: host.to_owned(),
                port: Some(port),
            },
            Err(_) => ServerEndpoint {
                host: without_scheme.to_owned(),
                port: None,
            },
        },
        _ => ServerEndpoint {
            host: without_scheme.to_owned(),
            port: None,
        },
    }
}

/// Everything needed to name and authenticate one voice session.
///
/// Channel and guild are known up front; the session id arrives with the
/// voice-state update and the endpoint/token/server id with the
/// voice-server update. Replaced wholesale at the start of every attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub session_id: Option<String>,
    pub server_id: Option<GuildId>,
    pub endpoint: Option<ServerEndpoint>,
    pub token: Option<String>,
}

impl ConnectionIdentity {
    /// Creates an identity with only the channel and guild populated.
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            channel_id,
            session_id: None,
            server_id: None,
            endpoint: None,
            token: None,
        }
    }

    /// Returns `true` once every field has been populated.
    pub fn is_complete(&self) -> bool {
        self.session_id.is_some()
            && self.server_id.is_some()
            && self.endpoint.is_some()
            && self.token.is_some()
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("session_id", &self.session_id)
            .field("server_id", &self.server_id)
            .field("endpoint", &self.endpoint)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}
