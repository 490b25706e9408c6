//! Configuration types for the voice bridge.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted when `discord.bot_token` is empty.
pub const TOKEN_ENV_VAR: &str = "DISCORD_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxConfig {
    /// Discord bot credentials and the voice channel to join.
    pub discord: DiscordConfig,
    /// Voice handshake settings.
    pub voice: VoiceSessionConfig,
    /// Transcriber subprocess settings.
    pub transcriber: TranscriberConfig,
    /// Where transcripts go.
    pub relay: RelayConfig,
    /// Log filter and optional log file.
    pub logging: LoggingConfig,
}

/// Discord settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token. Falls back to `DISCORD_TOKEN`.
    pub bot_token: String,
    /// Guild containing the voice channel.
    pub guild_id: Option<u64>,
    /// Voice channel to join on startup.
    pub voice_channel_id: Option<u64>,
    /// REST API base URL.
    pub api_base: String,
    /// Bound on each REST request, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            guild_id: None,
            voice_channel_id: None,
            api_base: "https://discord.com/api/v10".to_owned(),
            request_timeout_secs: 15,
        }
    }
}

/// Voice handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSessionConfig {
    /// How long to wait for both handshake signals, in seconds.
    pub handshake_timeout_secs: f64,
    pub self_deaf: bool,
    pub self_mute: bool,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 60.0,
            self_deaf: false,
            self_mute: false,
        }
    }
}

impl VoiceSessionConfig {
    /// Handshake timeout as a [`Duration`]. Non-finite or negative values
    /// collapse to zero; [`VoxConfig::validate`] rejects them up front.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.handshake_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

/// Transcriber subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Speech model passed as the final positional argument.
    pub model_path: Option<PathBuf>,
    /// Arguments placed before the session arguments.
    pub extra_args: Vec<String>,
    /// Bound on joining the reader threads after the child is killed.
    pub stop_timeout_ms: u64,
    /// Longest accepted notification line.
    pub max_line_bytes: usize,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("discrivener"),
            model_path: None,
            extra_args: Vec::new(),
            stop_timeout_ms: 5_000,
            max_line_bytes: 100 * 1024,
        }
    }
}

/// Transcript relay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Text channel that receives each transcript line. Log-only when unset.
    pub transcript_channel_id: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            file: None,
        }
    }
}

impl VoxConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voxgate/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("voxgate").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("voxgate")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/voxgate-config/config.toml")
        }
    }

    /// Fills an empty bot token from `token` (usually `DISCORD_TOKEN`).
    pub fn apply_token_fallback(&mut self, token: Option<String>) {
        if self.discord.bot_token.trim().is_empty() {
            if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
                self.discord.bot_token = token;
            }
        }
    }

    /// Checks that the bridge has what it needs to start.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.discord.bot_token.trim().is_empty() {
            return Err(VoiceError::Config(format!(
                "discord.bot_token is empty and {TOKEN_ENV_VAR} is not set"
            )));
        }
        if self.discord.guild_id.is_none() {
            return Err(VoiceError::Config("discord.guild_id is not set".to_owned()));
        }
        if self.discord.voice_channel_id.is_none() {
            return Err(VoiceError::Config(
                "discord.voice_channel_id is not set".to_owned(),
            ));
        }
        if self.discord.request_timeout_secs == 0 {
            return Err(VoiceError::Config(
                "discord.request_timeout_secs must be positive".to_owned(),
            ));
        }
        let timeout = self.voice.handshake_timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(VoiceError::Config(format!(
                "voice.handshake_timeout_secs must be positive, got {timeout}"
            )));
        }
        if self.transcriber.program.as_os_str().is_empty() {
            return Err(VoiceError::Config("transcriber.program is empty".to_owned()));
        }
        Ok(())
    }
}
