//! Voice connection lifecycle.
//!
//! [`VoiceConnection`] drives one logical voice session:
//!
//! 1. `connect()` clears the [`HandshakeGate`], asks the gateway to join the
//!    channel, and waits for both handshake signals.
//! 2. The gateway's voice-state update supplies the session id and raises
//!    the state signal. The voice-server update supplies endpoint and token;
//!    once both are known the transcriber and responder are started and the
//!    server signal is raised. The two updates may arrive in either order.
//! 3. Transcriber notifications arrive on the transcriber's own thread and
//!    are reconciled into the connection-state flags. A transcriber
//!    disconnect cannot tear the connection down inline, because teardown
//!    stops the transcriber and joins that very thread; it is posted to a
//!    task on the owner's runtime instead.
//! 4. `disconnect()` leaves the channel, stops the transcriber and responder,
//!    and always resets local state, whatever the gateway says.

use super::downstream::{Downstream, TranscriptSink};
use super::gate::{GateSignals, HandshakeGate};
use super::gateway::{
    ChannelLookup, VoiceGateway, VoiceServerUpdate, VoiceStateRequest, VoiceStateUpdate,
};
use super::identity::{ChannelId, ConnectionIdentity, GuildId, ServerEndpoint, normalize_endpoint};
use super::status::ConnectionStatus;
use crate::config::VoiceSessionConfig;
use crate::error::{Result, VoiceError};
use crate::transcriber::{LaunchParams, NotificationHandler, Transcriber, TranscriberNotification};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// Result of [`VoiceConnection::move_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The gateway was asked to move us; the transcriber stays on the
    /// session it was launched with.
    GatewayOnly,
    /// No target channel: the connection was torn down.
    Left,
}

/// Work posted from the notification thread to the owner's runtime.
#[derive(Debug, Clone, Copy)]
enum DeferredAction {
    TranscriberDisconnected { attempt: u64 },
}

/// Server details held until the session id is known.
struct PendingServer {
    server_id: GuildId,
    endpoint: ServerEndpoint,
    token: String,
}

struct ConnectionState {
    status: ConnectionStatus,
    identity: ConnectionIdentity,
    /// Incremented by every `connect()`.
    attempt: u64,
    /// A server update has been accepted for this attempt.
    launch_claimed: bool,
    pending_server: Option<PendingServer>,
    self_deaf: bool,
    self_mute: bool,
}

struct Shared {
    guild_id: GuildId,
    gateway: Arc<dyn VoiceGateway>,
    transcriber: Arc<dyn Transcriber>,
    downstream: Downstream,
    gate: Arc<HandshakeGate>,
    /// Last transcriber lifecycle notification was connect/reconnect.
    /// Written from the notification thread.
    transcriber_connected: Arc<AtomicBool>,
    state: Mutex<ConnectionState>,
    /// Wakes an in-flight `connect()` when the connection is torn down.
    teardown: Notify,
    deferred_tx: mpsc::UnboundedSender<DeferredAction>,
}

/// One logical voice connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct VoiceConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("VoiceConnection")
            .field("status", &state.status)
            .field("identity", &state.identity)
            .field("attempt", &state.attempt)
            .finish_non_exhaustive()
    }
}

impl VoiceConnection {
    /// Creates an idle connection for `channel_id` in `guild_id`.
    ///
    /// Must be called from within a Tokio runtime: the task that runs
    /// deferred teardown is spawned here.
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        gateway: Arc<dyn VoiceGateway>,
        transcriber: Arc<dyn Transcriber>,
        downstream: Downstream,
    ) -> Self {
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            guild_id,
            gateway,
            transcriber,
            downstream,
            gate: Arc::new(HandshakeGate::new()),
            transcriber_connected: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Idle,
                identity: ConnectionIdentity::new(guild_id, channel_id),
                attempt: 0,
                launch_claimed: false,
                pending_server: None,
                self_deaf: false,
                self_mute: false,
            }),
            teardown: Notify::new(),
            deferred_tx,
        });
        tokio::spawn(run_deferred(Arc::downgrade(&shared), deferred_rx));
        Self { shared }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn guild_id(&self) -> GuildId {
        self.shared.guild_id
    }

    /// The channel we are (or will be) in.
    pub fn channel_id(&self) -> ChannelId {
        self.lock().identity.channel_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    /// Snapshot of the current identity.
    pub fn identity(&self) -> ConnectionIdentity {
        self.lock().identity.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().identity.session_id.clone()
    }

    /// Current handshake gate signals.
    pub fn handshake_signals(&self) -> GateSignals {
        self.shared.gate.signals()
    }

    /// Live only when the gateway handshake completed, the transcriber is
    /// running, and its last lifecycle notification was a connect.
    ///
    /// The three conditions are read separately; the answer may be one
    /// notification stale.
    pub fn is_connected(&self) -> bool {
        let gateway_connected = self.status() == ConnectionStatus::Connected;
        gateway_connected
            && self.shared.transcriber.is_running()
            && self.shared.transcriber_connected.load(Ordering::SeqCst)
    }

    /// [`connect`](Self::connect) using the configured timeout and flags.
    pub async fn connect_with(&self, config: &VoiceSessionConfig) -> Result<()> {
        self.connect(config.handshake_timeout(), config.self_deaf, config.self_mute)
            .await
    }

    /// Joins the channel and waits for the handshake to complete.
    ///
    /// # Errors
    ///
    /// - [`VoiceError::AlreadyConnected`] if the connection is live; nothing
    ///   is sent and the gate is untouched.
    /// - [`VoiceError::Gateway`] if the join request could not be sent.
    /// - [`VoiceError::HandshakeTimeout`] if both signals did not arrive in
    ///   time; the connection is force-disconnected first.
    /// - [`VoiceError::HandshakeInterrupted`] if the connection was torn down
    ///   while waiting.
    pub async fn connect(&self, timeout: Duration, self_deaf: bool, self_mute: bool) -> Result<()> {
        let guild_id = self.shared.guild_id;
        tracing::info!(guild_id = %guild_id, "connecting to voice");

        if self.is_connected() {
            return Err(VoiceError::AlreadyConnected {
                channel_id: self.channel_id(),
            });
        }

        // Reconnect lap: a transcriber from a session that dropped out.
        if self.shared.transcriber.is_running() {
            tracing::debug!(guild_id = %guild_id, "stopping stale transcriber before handshake");
            if let Err(e) = self.shared.transcriber.stop().await {
                tracing::warn!(error = %e, "failed to stop stale transcriber");
            }
        }

        let (channel_id, attempt) = {
            let mut state = self.lock();
            self.shared.gate.clear();
            self.shared.transcriber_connected.store(false, Ordering::SeqCst);
            state.attempt += 1;
            state.identity = ConnectionIdentity::new(guild_id, state.identity.channel_id);
            state.launch_claimed = false;
            state.pending_server = None;
            state.self_deaf = self_deaf;
            state.self_mute = self_mute;
            transition(&mut state, ConnectionStatus::Handshaking);
            (state.identity.channel_id, state.attempt)
        };

        tracing::info!(
            guild_id = %guild_id,
            channel_id = %channel_id,
            attempt,
            "starting voice handshake"
        );

        let request = VoiceStateRequest::join(guild_id, channel_id, self_deaf, self_mute);
        if let Err(e) = self.shared.gateway.change_voice_state(request).await {
            transition(&mut self.lock(), ConnectionStatus::Disconnected);
            return Err(VoiceError::Gateway(format!("{e:#}")));
        }

        let torn_down = self.shared.teardown.notified();
        tokio::pin!(torn_down);
        torn_down.as_mut().enable();
        if !self.status().is_handshaking() {
            return Err(VoiceError::HandshakeInterrupted {
                reason: "connection torn down before the handshake wait".to_owned(),
            });
        }

        tokio::select! {
            waited = self.shared.gate.wait(timeout) => {
                if let Err(gate_timeout) = waited {
                    tracing::warn!(
                        guild_id = %guild_id,
                        channel_id = %channel_id,
                        state_signal = gate_timeout.signals.state,
                        server_signal = gate_timeout.signals.server,
                        "voice handshake timed out"
                    );
                    self.disconnect(true).await;
                    return Err(VoiceError::HandshakeTimeout { timeout });
                }
            }
            () = &mut torn_down => {
                return Err(VoiceError::HandshakeInterrupted {
                    reason: "connection torn down during the handshake".to_owned(),
                });
            }
        }

        {
            let mut state = self.lock();
            if !state.status.is_handshaking() {
                return Err(VoiceError::HandshakeInterrupted {
                    reason: format!("connection became {} during the handshake", state.status),
                });
            }
            transition(&mut state, ConnectionStatus::Connected);
            // Late signals from this attempt must not satisfy the next one.
            self.shared.gate.clear();
        }

        tracing::info!(guild_id = %guild_id, channel_id = %channel_id, "voice handshake complete");
        Ok(())
    }

    /// Handles a voice-state update for our own user.
    ///
    /// During the handshake this is the state signal. Afterwards it is the
    /// server changing our state: no channel means we were removed, a voice
    /// channel means we were moved.
    ///
    /// # Errors
    ///
    /// Returns an error only if a deferred transcriber launch fails.
    pub async fn on_voice_state_update(&self, update: VoiceStateUpdate) -> Result<()> {
        let guild_id = self.shared.guild_id;
        let (status, pending) = {
            let mut state = self.lock();
            state.identity.session_id = Some(update.session_id.clone());
            let pending = if state.status.is_handshaking() {
                state.pending_server.take()
            } else {
                None
            };
            (state.status, pending)
        };

        if status.is_handshaking() {
            tracing::debug!(
                guild_id = %guild_id,
                channel_id = ?update.channel_id,
                "voice state complete during handshake"
            );
            self.shared.gate.set_state();
            if let Some(server) = pending {
                self.launch(server).await?;
            }
            return Ok(());
        }

        tracing::debug!(
            guild_id = %guild_id,
            channel_id = ?update.channel_id,
            "server-initiated voice state update"
        );

        let Some(channel_id) = update.channel_id else {
            if status.is_established() {
                tracing::info!(guild_id = %guild_id, "removed from voice by the server");
                self.disconnect(true).await;
            }
            return Ok(());
        };

        match self.shared.gateway.lookup_channel(guild_id, channel_id) {
            ChannelLookup::Unknown => {
                tracing::warn!(
                    guild_id = %guild_id,
                    channel_id = %channel_id,
                    "channel not found in guild; ignoring voice state update"
                );
            }
            ChannelLookup::NotVoice => {
                tracing::warn!(
                    channel_id = %channel_id,
                    "channel is not a voice channel; ignoring voice state update"
                );
            }
            ChannelLookup::Voice => {
                let mut state = self.lock();
                if state.identity.channel_id != channel_id {
                    tracing::info!(
                        guild_id = %guild_id,
                        from = %state.identity.channel_id,
                        to = %channel_id,
                        "moved to another voice channel"
                    );
                    state.identity.channel_id = channel_id;
                }
            }
        }
        Ok(())
    }

    /// Handles a voice-server update.
    ///
    /// Partial updates (no endpoint or token yet) are logged and left for a
    /// later update or the handshake timeout. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the transcriber or responder fails to start; the
    /// server signal stays unset and the handshake times out.
    pub async fn on_voice_server_update(&self, update: VoiceServerUpdate) -> Result<()> {
        let ready = {
            let mut state = self.lock();
            if self.shared.gate.is_server_set()
                || state.launch_claimed
                || !state.status.is_handshaking()
            {
                tracing::warn!(guild_id = %update.guild_id, "ignoring extraneous voice server update");
                return Ok(());
            }

            let (Some(endpoint), Some(token)) = (update.endpoint.as_deref(), update.token.as_deref())
            else {
                tracing::warn!(
                    guild_id = %update.guild_id,
                    has_endpoint = update.endpoint.is_some(),
                    has_token = update.token.is_some(),
                    "awaiting voice endpoint; if the handshake times out, consider raising the timeout and reconnecting"
                );
                return Ok(());
            };

            let server = PendingServer {
                server_id: update.guild_id,
                endpoint: normalize_endpoint(endpoint),
                token: token.to_owned(),
            };
            state.launch_claimed = true;
            if state.identity.session_id.is_some() {
                Some(server)
            } else {
                tracing::debug!(
                    guild_id = %update.guild_id,
                    "voice server known before session id; deferring transcriber launch"
                );
                state.pending_server = Some(server);
                None
            }
        };

        if let Some(server) = ready {
            self.launch(server).await?;
        }
        Ok(())
    }

    async fn launch(&self, server: PendingServer) -> Result<()> {
        let (params, attempt) = {
            let mut state = self.lock();
            if !state.status.is_handshaking() {
                return Err(VoiceError::HandshakeInterrupted {
                    reason: format!("connection became {} before transcriber launch", state.status),
                });
            }
            let Some(session_id) = state.identity.session_id.clone() else {
                return Err(VoiceError::HandshakeInterrupted {
                    reason: "session id unknown at transcriber launch".to_owned(),
                });
            };
            state.identity.server_id = Some(server.server_id);
            state.identity.endpoint = Some(server.endpoint.clone());
            state.identity.token = Some(server.token.clone());
            let params = LaunchParams {
                channel_id: state.identity.channel_id,
                endpoint: server.endpoint,
                guild_id: server.server_id,
                session_id,
                user_id: self.shared.gateway.current_user_id(),
                token: server.token,
            };
            (params, state.attempt)
        };

        self.shared
            .transcriber
            .run(params, self.notification_handler(attempt))
            .await?;
        let live = attempt_is_live(&self.lock(), attempt);
        if !live {
            return Err(self.abandon_launch(attempt, false).await);
        }

        if let Err(e) = self.shared.downstream.responder.start().await {
            let live = attempt_is_live(&self.lock(), attempt);
            if !live {
                self.abandon_launch(attempt, false).await;
            }
            return Err(VoiceError::Responder(format!("{e:#}")));
        }

        {
            let state = self.lock();
            if attempt_is_live(&state, attempt) {
                self.shared.gate.set_server();
                return Ok(());
            }
        }
        Err(self.abandon_launch(attempt, true).await)
    }

    /// Stops what a launch started after its attempt was torn down.
    async fn abandon_launch(&self, attempt: u64, responder_started: bool) -> VoiceError {
        let status = self.status();
        tracing::warn!(
            guild_id = %self.shared.guild_id,
            attempt,
            status = %status,
            "handshake ended while the transcriber was launching; stopping it"
        );
        if let Err(e) = self.shared.transcriber.stop().await {
            tracing::warn!(error = %e, "failed to stop abandoned transcriber");
        }
        if responder_started {
            if let Err(e) = self.shared.downstream.responder.stop().await {
                tracing::warn!(error = %format!("{e:#}"), "failed to stop abandoned responder");
            }
        }
        VoiceError::HandshakeInterrupted {
            reason: format!("connection became {status} during transcriber launch"),
        }
    }

    fn notification_handler(&self, attempt: u64) -> NotificationHandler {
        let gate = Arc::clone(&self.shared.gate);
        let connected = Arc::clone(&self.shared.transcriber_connected);
        let transcript = Arc::clone(&self.shared.downstream.transcript);
        let deferred = self.shared.deferred_tx.clone();
        Arc::new(move |notification| {
            reconcile_notification(
                notification,
                attempt,
                &gate,
                &connected,
                transcript.as_ref(),
                &deferred,
            );
        })
    }

    /// Leaves voice and releases the session.
    ///
    /// No-op unless connected or `force` is set. Local cleanup always runs;
    /// a failed leave request or transcriber stop is logged, not returned.
    pub async fn disconnect(&self, force: bool) {
        if !force && !self.is_connected() {
            return;
        }

        let guild_id = self.shared.guild_id;
        let channel_id = {
            let mut state = self.lock();
            transition(&mut state, ConnectionStatus::Disconnected);
            state.identity.channel_id
        };
        self.shared.teardown.notify_waiters();
        tracing::info!(
            guild_id = %guild_id,
            channel_id = %channel_id,
            "the voice handshake is being terminated"
        );

        if let Err(e) = self
            .shared
            .gateway
            .change_voice_state(VoiceStateRequest::leave(guild_id))
            .await
        {
            tracing::warn!(guild_id = %guild_id, error = %format!("{e:#}"), "voice leave request failed");
        }
        if let Err(e) = self.shared.transcriber.stop().await {
            tracing::warn!(guild_id = %guild_id, error = %e, "failed to stop transcriber");
        }
        if let Err(e) = self.shared.downstream.responder.stop().await {
            tracing::warn!(guild_id = %guild_id, error = %format!("{e:#}"), "failed to stop responder");
        }

        self.cleanup();
    }

    fn cleanup(&self) {
        self.shared.transcriber_connected.store(false, Ordering::SeqCst);
        let mut state = self.lock();
        self.shared.gate.clear();
        state.launch_claimed = false;
        state.pending_server = None;
        state.identity = ConnectionIdentity::new(self.shared.guild_id, state.identity.channel_id);
        if state.status != ConnectionStatus::Disconnected {
            transition(&mut state, ConnectionStatus::Disconnected);
        }
    }

    /// Moves to another voice channel.
    ///
    /// Only the gateway moves: the transcriber keeps the session it was
    /// launched with, which the outcome reports. `None` disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Gateway`] if the request cannot be sent.
    pub async fn move_to(&self, channel_id: Option<ChannelId>) -> Result<MoveOutcome> {
        let Some(channel_id) = channel_id else {
            self.disconnect(true).await;
            return Ok(MoveOutcome::Left);
        };

        tracing::warn!(
            guild_id = %self.shared.guild_id,
            channel_id = %channel_id,
            "transcriber cannot follow a channel move; moving gateway only"
        );
        let (self_deaf, self_mute) = {
            let state = self.lock();
            (state.self_deaf, state.self_mute)
        };
        self.shared
            .gateway
            .change_voice_state(VoiceStateRequest::join(
                self.shared.guild_id,
                channel_id,
                self_deaf,
                self_mute,
            ))
            .await
            .map_err(|e| VoiceError::Gateway(format!("{e:#}")))?;
        Ok(MoveOutcome::GatewayOnly)
    }

    /// Resuming a dropped session without a fresh handshake.
    ///
    /// # Errors
    ///
    /// Always [`VoiceError::NotSupported`]; state is left untouched.
    pub fn reconnect(&self) -> Result<()> {
        tracing::warn!(guild_id = %self.shared.guild_id, "voice reconnect is not implemented");
        Err(VoiceError::NotSupported {
            operation: "reconnect",
        })
    }

    async fn on_transcriber_disconnected(&self, attempt: u64) {
        let (status, current) = {
            let state = self.lock();
            (state.status, state.attempt)
        };
        if attempt != current {
            tracing::debug!(attempt, current, "ignoring disconnect from a previous attempt");
            return;
        }
        if status == ConnectionStatus::Connected {
            // Resuming is not implemented, so this always ends in teardown.
            transition(&mut self.lock(), ConnectionStatus::PotentiallyReconnecting);
        }
        if status.is_handshaking() || status.is_established() {
            tracing::info!(
                guild_id = %self.shared.guild_id,
                "transcriber disconnected; tearing down voice connection"
            );
            self.disconnect(true).await;
        }
    }
}

fn attempt_is_live(state: &ConnectionState, attempt: u64) -> bool {
    state.attempt == attempt && state.status.is_handshaking()
}

fn transition(state: &mut ConnectionState, target: ConnectionStatus) {
    if !state.status.can_transition_to(target) {
        tracing::warn!(from = %state.status, to = %target, "unexpected connection status transition");
    }
    tracing::debug!(from = %state.status, to = %target, "connection status transition");
    state.status = target;
}

/// Applies one notification. Runs on the notification thread, so it only
/// touches the gate, the atomic flag, the sink, and the deferred queue.
fn reconcile_notification(
    notification: TranscriberNotification,
    attempt: u64,
    gate: &HandshakeGate,
    connected: &AtomicBool,
    transcript: &dyn TranscriptSink,
    deferred: &mpsc::UnboundedSender<DeferredAction>,
) {
    match notification {
        TranscriberNotification::Connect(info) | TranscriberNotification::Reconnect(info) => {
            tracing::debug!(?info, "transcriber connected");
            gate.set_state();
            connected.store(true, Ordering::SeqCst);
        }
        TranscriberNotification::Disconnect(info) => {
            tracing::debug!(?info, "transcriber disconnected");
            gate.set_state();
            connected.store(false, Ordering::SeqCst);
            if deferred
                .send(DeferredAction::TranscriberDisconnected { attempt })
                .is_err()
            {
                tracing::warn!("no owner task to schedule voice disconnect");
            }
        }
        TranscriberNotification::UserJoin(info) => {
            tracing::debug!(user_id = %info.user_id, "user joined voice");
        }
        TranscriberNotification::TranscribedMessage(message) => {
            transcript.on_transcribed_message(message);
        }
        TranscriberNotification::Unrecognized { kind } => {
            tracing::warn!(kind = %kind, "unknown transcriber notification");
        }
    }
}

async fn run_deferred(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<DeferredAction>) {
    while let Some(action) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let connection = VoiceConnection { shared };
        match action {
            DeferredAction::TranscriberDisconnected { attempt } => {
                connection.on_transcriber_disconnected(attempt).await;
            }
        }
    }
}
