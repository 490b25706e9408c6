//! Voice session handshake and lifecycle.

pub mod connection;
pub mod downstream;
pub mod gate;
pub mod gateway;
pub mod identity;
pub mod status;

pub use connection::{MoveOutcome, VoiceConnection};
pub use downstream::{Downstream, Responder, TranscriptChannel, TranscriptSink};
pub use gate::{GateSignals, GateTimeout, HandshakeGate};
pub use gateway::{ChannelLookup, VoiceGateway, VoiceServerUpdate, VoiceStateRequest, VoiceStateUpdate};
pub use identity::{ChannelId, ConnectionIdentity, GuildId, ServerEndpoint, UserId, normalize_endpoint};
pub use status::ConnectionStatus;
