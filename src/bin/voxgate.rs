//! Voxgate bridge binary.
//!
//! Usage: `voxgate [config-path]`. Connects to the Discord gateway, joins
//! the configured voice channel once the guild is available, and relays
//! transcripts until Ctrl-C.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use voxgate::config::{LoggingConfig, TOKEN_ENV_VAR, VoiceSessionConfig, VoxConfig};
use voxgate::discord::{
    DiscordClient, DiscordVoiceGateway, GatewayEvent, TranscriptRelay, VoiceEvent,
    run_gateway_session,
};
use voxgate::voice::{ChannelId, Downstream, GuildId, TranscriptChannel, VoiceConnection};
use voxgate::ProcessTranscriber;

const GATEWAY_RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(VoxConfig::default_config_path);
    let config_found = config_path.exists();
    let mut config = if config_found {
        VoxConfig::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        VoxConfig::default()
    };
    config.apply_token_fallback(std::env::var(TOKEN_ENV_VAR).ok());

    let _log_guard = init_tracing(&config.logging)?;
    if !config_found {
        tracing::warn!(path = %config_path.display(), "config file not found; using defaults");
    }
    config.validate()?;

    let guild_id = GuildId(config.discord.guild_id.context("discord.guild_id is not set")?);
    let channel_id = ChannelId(
        config
            .discord
            .voice_channel_id
            .context("discord.voice_channel_id is not set")?,
    );
    tracing::info!(guild_id = %guild_id, channel_id = %channel_id, "voxgate starting");

    let client = Arc::new(DiscordClient::new(&config.discord)?);
    let (gateway, mut outbound) = DiscordVoiceGateway::new(&config.discord.bot_token);
    let gateway = Arc::new(gateway);

    let (sink, transcripts) = TranscriptChannel::new();
    let relay_target = config
        .relay
        .transcript_channel_id
        .map(|id| (Arc::clone(&client), ChannelId(id)));
    let relay = Arc::new(TranscriptRelay::new(transcripts, relay_target));
    let transcriber = Arc::new(ProcessTranscriber::new(config.transcriber.clone()));
    let connection = VoiceConnection::new(
        guild_id,
        channel_id,
        gateway.clone(),
        transcriber,
        Downstream::new(Arc::new(sink), relay),
    );

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let session = {
        let client = Arc::clone(&client);
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            loop {
                match run_gateway_session(&client, &gateway, &mut outbound, &events_tx).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "gateway session ended; retrying");
                    }
                }
                tokio::time::sleep(GATEWAY_RETRY_DELAY).await;
            }
        })
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
                tracing::info!("shutting down");
                break;
            }
            event = events_rx.recv() => {
                let Some(event) = event else {
                    tracing::error!("gateway session task exited");
                    break;
                };
                route_event(event, &connection, &config.voice);
            }
        }
    }

    connection.disconnect(true).await;
    session.abort();
    tracing::info!("voxgate shut down cleanly");
    Ok(())
}

/// Dispatches one gateway event. Voice work runs on its own task so the
/// event loop keeps reading while `connect` waits on the handshake.
fn route_event(event: GatewayEvent, connection: &VoiceConnection, voice: &VoiceSessionConfig) {
    let guild_id = connection.guild_id();
    match event {
        GatewayEvent::Ready { user_id } => {
            tracing::info!(user_id = %user_id, "discord session ready");
        }
        GatewayEvent::GuildAvailable { guild_id: available } if available == guild_id => {
            let status = connection.status();
            if connection.is_connected() || status.is_handshaking() {
                tracing::debug!(status = %status, "guild available again; voice already up");
                return;
            }
            let connection = connection.clone();
            let voice = voice.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.connect_with(&voice).await {
                    tracing::error!(error = %e, "voice connect failed");
                }
            });
        }
        GatewayEvent::GuildAvailable { .. } => {}
        GatewayEvent::Voice(VoiceEvent::State(update)) => {
            if update.guild_id.is_some_and(|g| g != guild_id) {
                return;
            }
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.on_voice_state_update(update).await {
                    tracing::error!(error = %e, "voice state update failed");
                }
            });
        }
        GatewayEvent::Voice(VoiceEvent::Server(update)) => {
            if update.guild_id != guild_id {
                return;
            }
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.on_voice_server_update(update).await {
                    tracing::error!(error = %e, "voice server update failed");
                }
            });
        }
    }
}

/// Logs to stderr, plus `logging.file` when set. `RUST_LOG` overrides the
/// configured filter.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter))
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("logging.file has no file name: {}", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}
