//! Discord plumbing: the gateway session, voice-state requests, and the
//! transcript relay.

pub mod client;
pub mod gateway;
pub mod relay;

pub use client::{DiscordClient, run_gateway_session};
pub use gateway::{DiscordVoiceGateway, GatewayEvent, VoiceEvent};
pub use relay::TranscriptRelay;
