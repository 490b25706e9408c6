//! Voxgate: a Discord voice bridge.
//!
//! Joins a voice channel, hands the voice session to an out-of-process
//! transcriber, and relays what it hears.
//!
//! # Architecture
//!
//! - **voice**: the handshake gate and the [`VoiceConnection`] state machine
//!   that reconciles gateway updates and transcriber notifications
//! - **transcriber**: the [`Transcriber`] seam and the subprocess
//!   implementation speaking JSON lines on stdout
//! - **discord**: gateway websocket, REST client, and transcript relay
//! - **config**: TOML configuration

pub mod config;
pub mod discord;
pub mod error;
pub mod transcriber;
pub mod voice;

pub use config::VoxConfig;
pub use error::{Result, VoiceError};
pub use transcriber::{ProcessTranscriber, Transcriber, TranscriberError, TranscriberNotification};
pub use voice::{ConnectionStatus, Downstream, VoiceConnection};
