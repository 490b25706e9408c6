//! Voice connection lifecycle status.

use std::fmt;

/// Lifecycle status of a [`VoiceConnection`](super::connection::VoiceConnection).
///
/// ```text
/// Idle → Handshaking → Connected ──→ PotentiallyReconnecting
///            ↑             │                 │
///            └─────────────┘ (reconnect lap) │
///   any ──────────────────→ Disconnected ←───┘
///   Disconnected → Handshaking (fresh connect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Constructed, never connected.
    #[default]
    Idle,
    /// Voice-state change requested; waiting for both gateway signals.
    Handshaking,
    /// Handshake complete and the session marked live.
    Connected,
    /// The gateway closed the session in a way that may be followed by a
    /// move or a reconnect.
    PotentiallyReconnecting,
    /// Torn down. The connection may be reused with a fresh `connect()`.
    Disconnected,
}

impl ConnectionStatus {
    /// Returns `true` if a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Idle, Self::Handshaking)
                | (Self::Handshaking, Self::Connected)
                | (Self::Connected, Self::Handshaking)
                | (Self::Connected, Self::PotentiallyReconnecting)
                | (Self::PotentiallyReconnecting, Self::Handshaking)
                | (Self::PotentiallyReconnecting, Self::Connected)
                | (Self::Disconnected, Self::Handshaking)
                | (_, Self::Disconnected)
        )
    }

    /// Returns `true` while a handshake attempt is in flight.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Handshaking)
    }

    /// Returns `true` if the gateway side considers the session live.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::PotentiallyReconnecting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::PotentiallyReconnecting => "potentially-reconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}
