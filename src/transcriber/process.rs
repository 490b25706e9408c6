//! Subprocess-backed transcriber.
//!
//! Spawns the transcriber executable with the session's credentials on its
//! command line and reads newline-delimited JSON notifications from its
//! stdout on a dedicated OS thread. A second thread relays stderr into the
//! log. [`ProcessTranscriber::stop`] kills the child and joins both threads,
//! which is why it refuses to run on the notification thread itself.

use super::error::TranscriberError;
use super::protocol::{DisconnectInfo, TranscriberNotification, parse_notification};
use super::{LaunchParams, NotificationHandler, Transcriber};
use crate::config::TranscriberConfig;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One spawned transcriber and its reader threads.
struct RunningSession {
    child: Child,
    /// Set before the child is killed so the reader does not report the
    /// resulting EOF as an unexpected exit.
    stopping: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl RunningSession {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn owns_current_thread(&self) -> bool {
        let current = thread::current().id();
        self.threads.iter().any(|t| t.thread().id() == current)
    }

    /// Kills and reaps the child, then joins the reader threads. Blocking.
    fn shutdown(&mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid, error = %e, "transcriber kill failed (already exited?)");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(pid, error = %e, "failed to reap transcriber process");
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(pid, "transcriber reader thread panicked");
            }
        }
        tracing::debug!(pid, "transcriber process stopped");
    }
}

impl Drop for RunningSession {
    fn drop(&mut self) {
        // Cannot wait here; the OS reaps the zombie eventually.
        let _ = self.child.kill();
    }
}

/// Transcriber that runs as a child process.
pub struct ProcessTranscriber {
    config: TranscriberConfig,
    running: Mutex<Option<RunningSession>>,
}

impl fmt::Debug for ProcessTranscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTranscriber")
            .field("program", &self.config.program)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProcessTranscriber {
    pub fn new(config: TranscriberConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningSession>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_session(
        &self,
        params: &LaunchParams,
        on_notification: NotificationHandler,
    ) -> Result<RunningSession, TranscriberError> {
        let mut child = Command::new(&self.config.program)
            .args(launch_args(&self.config, params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TranscriberError::SpawnFailed)?;

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            return Err(TranscriberError::ProtocolError {
                message: "transcriber stdio was not piped".to_owned(),
            });
        };

        let stopping = Arc::new(AtomicBool::new(false));
        let mut session = RunningSession {
            child,
            stopping: Arc::clone(&stopping),
            threads: Vec::with_capacity(2),
        };

        let max_line_bytes = self.config.max_line_bytes;
        let notify = thread::Builder::new()
            .name(format!("transcriber-notify-{pid}"))
            .spawn(move || pump_notifications(stdout, on_notification, stopping, max_line_bytes))
            .map_err(TranscriberError::SpawnFailed)?;
        session.threads.push(notify);

        let stderr_relay = thread::Builder::new()
            .name(format!("transcriber-stderr-{pid}"))
            .spawn(move || pump_stderr(stderr, pid))
            .map_err(TranscriberError::SpawnFailed)?;
        session.threads.push(stderr_relay);

        Ok(session)
    }
}

#[async_trait]
impl Transcriber for ProcessTranscriber {
    async fn run(
        &self,
        params: LaunchParams,
        on_notification: NotificationHandler,
    ) -> Result<(), TranscriberError> {
        let mut guard = self.lock();
        if let Some(existing) = guard.as_mut() {
            if existing.is_alive() {
                return Err(TranscriberError::AlreadyRunning);
            }
        }
        // A previous session that exited on its own; its readers have hit EOF.
        if let Some(mut stale) = guard.take() {
            stale.stopping.store(true, Ordering::SeqCst);
            stale.shutdown();
        }

        let session = self.spawn_session(&params, on_notification)?;
        tracing::info!(
            pid = session.child.id(),
            guild_id = %params.guild_id,
            channel_id = %params.channel_id,
            endpoint = %params.endpoint,
            "transcriber started"
        );
        *guard = Some(session);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TranscriberError> {
        let session = {
            let mut guard = self.lock();
            if guard
                .as_ref()
                .is_some_and(RunningSession::owns_current_thread)
            {
                return Err(TranscriberError::StopFromNotificationContext);
            }
            guard.take()
        };
        let Some(mut session) = session else {
            return Ok(());
        };
        session.stopping.store(true, Ordering::SeqCst);

        let timeout_ms = self.config.stop_timeout_ms;
        let join = tokio::task::spawn_blocking(move || session.shutdown());
        match tokio::time::timeout(Duration::from_millis(timeout_ms), join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TranscriberError::ProtocolError {
                message: format!("transcriber shutdown task failed: {e}"),
            }),
            Err(_) => Err(TranscriberError::StopTimeout { timeout_ms }),
        }
    }

    fn is_running(&self) -> bool {
        self.lock().as_mut().is_some_and(RunningSession::is_alive)
    }
}

/// Command-line arguments for one launch, after the configured extras.
pub fn launch_args(config: &TranscriberConfig, params: &LaunchParams) -> Vec<OsString> {
    let mut args: Vec<OsString> = config.extra_args.iter().map(OsString::from).collect();
    let pairs = [
        ("--channel-id", params.channel_id.to_string()),
        ("--endpoint", params.endpoint.to_string()),
        ("--guild-id", params.guild_id.to_string()),
        ("--session-id", params.session_id.clone()),
        ("--user-id", params.user_id.to_string()),
        ("--voice-token", params.token.clone()),
    ];
    for (flag, value) in pairs {
        args.push(flag.into());
        args.push(value.into());
    }
    if let Some(model) = &config.model_path {
        args.push(model.clone().into_os_string());
    }
    args
}

/// Outcome of one [`read_bounded_line`] call.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    /// The line exceeded the bound; its remainder has been discarded.
    Oversized,
}

/// Reads one line into `buf`, holding at most `max_line_bytes + 1` bytes.
fn read_bounded_line(
    reader: &mut impl BufRead,
    buf: &mut Vec<u8>,
    max_line_bytes: usize,
) -> std::io::Result<LineRead> {
    buf.clear();
    let limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX).saturating_add(1);
    if reader.by_ref().take(limit).read_until(b'\n', buf)? == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.len() <= max_line_bytes {
        return Ok(LineRead::Line);
    }
    if buf.last() != Some(&b'\n') {
        discard_rest_of_line(reader)?;
    }
    buf.clear();
    Ok(LineRead::Oversized)
}

fn discard_rest_of_line(reader: &mut impl BufRead) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

fn pump_notifications(
    stdout: impl Read,
    on_notification: NotificationHandler,
    stopping: Arc<AtomicBool>,
    max_line_bytes: usize,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut disconnected = false;

    loop {
        match read_bounded_line(&mut reader, &mut buf, max_line_bytes) {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::Line) => {}
            Ok(LineRead::Oversized) => {
                tracing::warn!(
                    error = %TranscriberError::OutputTruncated { max_bytes: max_line_bytes },
                    "skipping oversized transcriber line"
                );
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transcriber stdout read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }

        match parse_notification(&line) {
            Ok(notification) => {
                match &notification {
                    TranscriberNotification::Disconnect(_) => disconnected = true,
                    TranscriberNotification::Connect(_) | TranscriberNotification::Reconnect(_) => {
                        disconnected = false;
                    }
                    _ => {}
                }
                on_notification(notification);
            }
            Err(e) => tracing::warn!(error = %e, "skipping unparsable transcriber line"),
        }
    }

    if !disconnected && !stopping.load(Ordering::SeqCst) {
        tracing::warn!("transcriber output closed without a disconnect notification");
        on_notification(TranscriberNotification::Disconnect(
            DisconnectInfo::process_exited(),
        ));
    }
}

fn pump_stderr(stderr: impl Read, pid: u32) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => tracing::debug!(pid, line = %line.trim_end(), "transcriber stderr"),
            Err(_) => break,
        }
    }
}
