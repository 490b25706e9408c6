//! Shared fakes and fixtures for integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use voxgate::transcriber::protocol::{ConnectInfo, DisconnectInfo};
use voxgate::transcriber::{
    LaunchParams, NotificationHandler, TranscribedMessage, Transcriber, TranscriberError,
    TranscriberNotification,
};
use voxgate::voice::{
    ChannelId, ChannelLookup, Downstream, GuildId, Responder, TranscriptSink, UserId,
    VoiceConnection, VoiceGateway, VoiceServerUpdate, VoiceStateRequest, VoiceStateUpdate,
};

pub(crate) const GUILD: GuildId = GuildId(100);
pub(crate) const CHANNEL: ChannelId = ChannelId(200);
pub(crate) const OTHER_VOICE: ChannelId = ChannelId(201);
pub(crate) const TEXT_CHANNEL: ChannelId = ChannelId(202);
pub(crate) const BOT_USER: UserId = UserId(300);

pub(crate) const ENDPOINT: &str = "wss://region123.example.com:443";
pub(crate) const TOKEN: &str = "voice-token";

/// Gateway that records every request instead of sending it.
pub(crate) struct FakeGateway {
    requests: Mutex<Vec<VoiceStateRequest>>,
    channels: HashMap<ChannelId, ChannelLookup>,
    pub(crate) fail_join: AtomicBool,
    pub(crate) fail_leave: AtomicBool,
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        let channels = HashMap::from([
            (CHANNEL, ChannelLookup::Voice),
            (OTHER_VOICE, ChannelLookup::Voice),
            (TEXT_CHANNEL, ChannelLookup::NotVoice),
        ]);
        Self {
            requests: Mutex::new(Vec::new()),
            channels,
            fail_join: AtomicBool::new(false),
            fail_leave: AtomicBool::new(false),
        }
    }

    pub(crate) fn requests(&self) -> Vec<VoiceStateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn joins(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.channel_id.is_some())
            .count()
    }

    pub(crate) fn leaves(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.channel_id.is_none())
            .count()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn change_voice_state(&self, request: VoiceStateRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request);
        let failing = if request.channel_id.is_some() {
            &self.fail_join
        } else {
            &self.fail_leave
        };
        if failing.load(Ordering::SeqCst) {
            anyhow::bail!("gateway unavailable");
        }
        Ok(())
    }

    fn lookup_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> ChannelLookup {
        if guild_id != GUILD {
            return ChannelLookup::Unknown;
        }
        self.channels
            .get(&channel_id)
            .copied()
            .unwrap_or(ChannelLookup::Unknown)
    }

    fn current_user_id(&self) -> UserId {
        BOT_USER
    }
}

#[derive(Default)]
struct FakeSession {
    launches: Vec<LaunchParams>,
    handlers: Vec<NotificationHandler>,
    running: bool,
    threads: Vec<JoinHandle<()>>,
    stops: usize,
}

/// Transcriber that delivers scripted notifications from its own threads,
/// the way a real subprocess reader would.
pub(crate) struct FakeTranscriber {
    session: Mutex<FakeSession>,
    /// Emit `Connect` as soon as `run()` is called.
    auto_connect: bool,
    /// How long `run()` spends "spawning" before the session is live.
    run_delay: Duration,
}

impl FakeTranscriber {
    pub(crate) fn new(auto_connect: bool) -> Self {
        Self {
            session: Mutex::new(FakeSession::default()),
            auto_connect,
            run_delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub(crate) fn launches(&self) -> Vec<LaunchParams> {
        self.session.lock().unwrap().launches.clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.session.lock().unwrap().stops
    }

    /// Delivers `notifications`, in order, through the latest launch's handler.
    pub(crate) fn emit(&self, notifications: Vec<TranscriberNotification>) {
        let launch = self.session.lock().unwrap().handlers.len() - 1;
        self.emit_from_launch(launch, notifications);
    }

    /// Delivers through the handler given to the `launch`-th `run()` call.
    pub(crate) fn emit_from_launch(&self, launch: usize, notifications: Vec<TranscriberNotification>) {
        let mut session = self.session.lock().unwrap();
        let handler = Arc::clone(&session.handlers[launch]);
        let thread = std::thread::spawn(move || {
            for notification in notifications {
                handler(notification);
            }
        });
        session.threads.push(thread);
    }

    /// The process died: it stops running and reports a disconnect.
    pub(crate) fn crash(&self) {
        self.session.lock().unwrap().running = false;
        self.emit(vec![TranscriberNotification::Disconnect(
            DisconnectInfo::process_exited(),
        )]);
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn run(
        &self,
        params: LaunchParams,
        on_notification: NotificationHandler,
    ) -> Result<(), TranscriberError> {
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        {
            let mut session = self.session.lock().unwrap();
            if session.running {
                return Err(TranscriberError::AlreadyRunning);
            }
            session.running = true;
            session.launches.push(params);
            session.handlers.push(on_notification);
        }
        if self.auto_connect {
            self.emit(vec![TranscriberNotification::Connect(ConnectInfo::default())]);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TranscriberError> {
        let threads = {
            let mut session = self.session.lock().unwrap();
            session.running = false;
            session.stops += 1;
            std::mem::take(&mut session.threads)
        };
        tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await
        .unwrap();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.session.lock().unwrap().running
    }
}

/// Sink that keeps every transcript it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    messages: Mutex<Vec<TranscribedMessage>>,
}

impl RecordingSink {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }
}

impl TranscriptSink for RecordingSink {
    fn on_transcribed_message(&self, message: TranscribedMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Responder that counts starts and stops.
#[derive(Default)]
pub(crate) struct RecordingResponder {
    pub(crate) starts: AtomicUsize,
    pub(crate) stops: AtomicUsize,
    pub(crate) fail_start: AtomicBool,
    pub(crate) start_delay_ms: AtomicU64,
}

#[async_trait]
impl Responder for RecordingResponder {
    async fn start(&self) -> anyhow::Result<()> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("responder refused to start");
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) connection: VoiceConnection,
    pub(crate) gateway: Arc<FakeGateway>,
    pub(crate) transcriber: Arc<FakeTranscriber>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) responder: Arc<RecordingResponder>,
}

/// A fresh idle connection. Must be called inside a Tokio runtime.
pub(crate) fn harness(auto_connect: bool) -> Harness {
    harness_with(FakeTranscriber::new(auto_connect))
}

pub(crate) fn harness_with(transcriber: FakeTranscriber) -> Harness {
    let gateway = Arc::new(FakeGateway::new());
    let transcriber = Arc::new(transcriber);
    let sink = Arc::new(RecordingSink::default());
    let responder = Arc::new(RecordingResponder::default());
    let connection = VoiceConnection::new(
        GUILD,
        CHANNEL,
        Arc::clone(&gateway) as Arc<dyn VoiceGateway>,
        Arc::clone(&transcriber) as Arc<dyn Transcriber>,
        Downstream::new(
            Arc::clone(&sink) as Arc<dyn TranscriptSink>,
            Arc::clone(&responder) as Arc<dyn Responder>,
        ),
    );
    Harness {
        connection,
        gateway,
        transcriber,
        sink,
        responder,
    }
}

pub(crate) fn state_update(session_id: &str, channel_id: Option<ChannelId>) -> VoiceStateUpdate {
    VoiceStateUpdate {
        session_id: session_id.to_owned(),
        channel_id,
        guild_id: Some(GUILD),
        user_id: Some(BOT_USER),
    }
}

pub(crate) fn server_update(endpoint: Option<&str>, token: Option<&str>) -> VoiceServerUpdate {
    VoiceServerUpdate {
        token: token.map(str::to_owned),
        guild_id: GUILD,
        endpoint: endpoint.map(str::to_owned),
    }
}

pub(crate) fn full_server_update() -> VoiceServerUpdate {
    server_update(Some(ENDPOINT), Some(TOKEN))
}

pub(crate) fn transcript(user: u64, text: &str) -> TranscriberNotification {
    TranscriberNotification::TranscribedMessage(TranscribedMessage {
        user_id: UserId(user),
        text: text.to_owned(),
        timestamp_ms: None,
    })
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Starts `connect()` on a task and returns once the join request is out,
/// so the connection is handshaking.
pub(crate) async fn start_connect(
    harness: &Harness,
    timeout: Duration,
) -> tokio::task::JoinHandle<voxgate::Result<()>> {
    let joins_before = harness.gateway.joins();
    let connection = harness.connection.clone();
    let task = tokio::spawn(async move { connection.connect(timeout, false, false).await });
    assert!(
        eventually(|| harness.gateway.joins() > joins_before).await,
        "join request never sent"
    );
    task
}

/// Runs a full handshake with both updates in the usual order.
pub(crate) async fn connect_fully(harness: &Harness) {
    let task = start_connect(harness, Duration::from_secs(5)).await;
    harness
        .connection
        .on_voice_state_update(state_update("session-1", Some(CHANNEL)))
        .await
        .unwrap();
    harness
        .connection
        .on_voice_server_update(full_server_update())
        .await
        .unwrap();
    task.await.unwrap().unwrap();
}

/// Formatted log output collected from a thread-local subscriber.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Routes this thread's `tracing` events here until the guard drops.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .matches(needle)
            .count()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
