//! Two-signal handshake gate.
//!
//! A voice handshake is complete once the gateway has told us both our voice
//! state (session id) and our voice server (endpoint + token). The two
//! updates arrive independently and in either order, and the state signal
//! may also be raised from the transcriber's notification thread, so the
//! gate is backed by a [`tokio::sync::watch`] channel: setters are plain
//! synchronous calls usable from any thread, and waiters observe the first
//! moment both flags are true.

use std::time::Duration;
use tokio::sync::watch;

/// Snapshot of both handshake signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSignals {
    /// Voice-state update received (session id known).
    pub state: bool,
    /// Voice-server update processed (transcriber launched).
    pub server: bool,
}

impl GateSignals {
    /// Returns `true` when both signals are set.
    pub fn is_complete(self) -> bool {
        self.state && self.server
    }
}

/// The gate did not settle before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handshake gate timed out after {waited:?} (state: {}, server: {})", .signals.state, .signals.server)]
pub struct GateTimeout {
    /// How long the caller waited.
    pub waited: Duration,
    /// Which signals had arrived when the wait gave up.
    pub signals: GateSignals,
}

/// Holds the two handshake signals for the current attempt.
#[derive(Debug)]
pub struct HandshakeGate {
    tx: watch::Sender<GateSignals>,
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateSignals::default());
        Self { tx }
    }

    /// Resets both signals for a fresh attempt.
    pub fn clear(&self) {
        self.tx.send_if_modified(|signals| {
            let changed = *signals != GateSignals::default();
            *signals = GateSignals::default();
            changed
        });
    }

    /// Marks the voice-state signal. Returns `false` if it was already set.
    pub fn set_state(&self) -> bool {
        self.tx.send_if_modified(|signals| {
            let newly = !signals.state;
            signals.state = true;
            newly
        })
    }

    /// Marks the voice-server signal. Returns `false` if it was already set.
    pub fn set_server(&self) -> bool {
        self.tx.send_if_modified(|signals| {
            let newly = !signals.server;
            signals.server = true;
            newly
        })
    }

    /// Current signal snapshot.
    pub fn signals(&self) -> GateSignals {
        *self.tx.borrow()
    }

    pub fn is_state_set(&self) -> bool {
        self.signals().state
    }

    pub fn is_server_set(&self) -> bool {
        self.signals().server
    }

    pub fn is_complete(&self) -> bool {
        self.signals().is_complete()
    }

    /// Suspends until both signals are set or `timeout` elapses.
    ///
    /// Never retries; a timed-out caller decides what to do next.
    pub async fn wait(&self, timeout: Duration) -> Result<(), GateTimeout> {
        let mut rx = self.tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|signals| signals.is_complete())).await {
            // The sender lives in `self`, so the channel cannot close while we wait.
            Ok(_) => Ok(()),
            Err(_) => Err(GateTimeout {
                waited: timeout,
                signals: self.signals(),
            }),
        }
    }
}
