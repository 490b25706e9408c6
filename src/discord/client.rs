//! Discord REST calls and the gateway websocket loop.

use super::gateway::{DiscordVoiceGateway, GatewayEvent};
use crate::config::DiscordConfig;
use crate::voice::ChannelId;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// GUILDS | GUILD_VOICE_STATES
pub const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 7);

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
const DEFAULT_HEARTBEAT_MS: u64 = 41_250;

/// Thin Discord REST client.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl DiscordClient {
    /// Builds a client whose requests give up after
    /// `request_timeout_secs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &DiscordConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// Resolves the websocket URL to connect to.
    pub async fn gateway_url(&self) -> anyhow::Result<String> {
        let response: Value = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.authorization())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let url = response
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_GATEWAY_URL);
        Ok(format!("{url}/?v=10&encoding=json"))
    }

    /// Posts a text message to `channel_id`.
    pub async fn post_message(&self, channel_id: ChannelId, content: &str) -> anyhow::Result<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.authorization())
            .json(&json!({ "content": content }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("discord send failed ({status}): {body}");
        }
        Ok(())
    }
}

/// Runs one gateway session until the socket closes or `events` is dropped.
///
/// Frames queued on `outbound` (voice state requests) are written to the
/// socket; dispatches are handed to `gateway` and any resulting
/// [`GatewayEvent`] is forwarded on `events`. The receiver is borrowed so a
/// caller can run a fresh session with it after this one ends.
///
/// # Errors
///
/// Returns an error when the session ends for any reason other than the
/// event receiver going away.
pub async fn run_gateway_session(
    client: &DiscordClient,
    gateway: &DiscordVoiceGateway,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::Sender<GatewayEvent>,
) -> anyhow::Result<()> {
    if client.bot_token().trim().is_empty() {
        anyhow::bail!("discord bot token is empty");
    }

    let ws_url = client.gateway_url().await?;
    tracing::info!(url = %ws_url, "connecting to discord gateway");
    let (stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (mut write, mut read) = stream.split();

    let hello = read
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("no hello"))??;
    let hello_text = match hello {
        Message::Text(text) => text.to_string(),
        _ => anyhow::bail!("unexpected discord hello payload"),
    };
    let hello_json: Value = serde_json::from_str(&hello_text)?;
    let heartbeat_interval_ms = hello_json
        .get("d")
        .and_then(|v| v.get("heartbeat_interval"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_HEARTBEAT_MS);

    write
        .send(Message::Text(identify_frame(client.bot_token()).to_string()))
        .await?;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
    // The first tick fires immediately; identify already went out.
    heartbeat.tick().await;
    let mut sequence: Option<u64> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if write.send(Message::Text(heartbeat_frame(sequence).to_string())).await.is_err() {
                    anyhow::bail!("discord heartbeat failed");
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    anyhow::bail!("voice gateway dropped");
                };
                write.send(Message::Text(frame)).await?;
            }
            maybe_msg = read.next() => {
                let raw = match maybe_msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(frame))) => {
                        anyhow::bail!("discord websocket closed: {frame:?}");
                    }
                    None => anyhow::bail!("discord websocket closed"),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => anyhow::bail!("discord websocket error: {err}"),
                };

                let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
                    tracing::debug!("skipping non-JSON gateway frame");
                    continue;
                };
                if let Some(s) = payload.get("s").and_then(Value::as_u64) {
                    sequence = Some(s);
                }

                match payload.get("op").and_then(Value::as_u64) {
                    Some(0) => {}
                    Some(1) => {
                        write.send(Message::Text(heartbeat_frame(sequence).to_string())).await?;
                        continue;
                    }
                    Some(7) => anyhow::bail!("discord requested a reconnect"),
                    Some(9) => anyhow::bail!("discord invalidated the session"),
                    _ => continue,
                }

                let event_name = payload.get("t").and_then(Value::as_str).unwrap_or_default();
                let Some(data) = payload.get("d") else {
                    continue;
                };
                let Some(event) = gateway.observe_dispatch(event_name, data) else {
                    continue;
                };
                if events.send(event).await.is_err() {
                    tracing::info!("gateway event receiver closed; ending session");
                    return Ok(());
                }
            }
        }
    }
}

fn identify_frame(token: &str) -> Value {
    json!({
        "op": 2,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "voxgate",
                "device": "voxgate"
            }
        }
    })
}

fn heartbeat_frame(sequence: Option<u64>) -> Value {
    json!({"op": 1, "d": sequence})
}
