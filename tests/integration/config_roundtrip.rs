//! Config file loading as the binary does it.

use std::time::Duration;
use tempfile::TempDir;
use voxgate::VoiceError;
use voxgate::config::VoxConfig;

const FULL_CONFIG: &str = r#"
[discord]
bot_token = "bot-token"
guild_id = 1234
voice_channel_id = 5678

[voice]
handshake_timeout_secs = 2.5
self_deaf = true

[transcriber]
program = "/opt/discrivener/bin/discrivener"
model_path = "/opt/models/ggml-base.en.bin"
extra_args = ["--log-level", "warn"]

[relay]
transcript_channel_id = 42

[logging]
filter = "voxgate=debug"
file = "/var/log/voxgate.log"
"#;

#[test]
fn full_config_loads_and_validates() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL_CONFIG).expect("write config");

    let config = VoxConfig::from_file(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.discord.guild_id, Some(1234));
    assert_eq!(config.voice.handshake_timeout(), Duration::from_millis(2500));
    assert!(config.voice.self_deaf);
    assert!(!config.voice.self_mute);
    assert_eq!(config.transcriber.extra_args, vec!["--log-level", "warn"]);
    assert_eq!(config.relay.transcript_channel_id, Some(42));
    assert_eq!(config.logging.filter, "voxgate=debug");
}

#[test]
fn token_from_environment_satisfies_validation() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL_CONFIG.replace("bot_token = \"bot-token\"", ""))
        .expect("write config");

    let mut config = VoxConfig::from_file(&path).unwrap();
    assert!(matches!(config.validate(), Err(VoiceError::Config(_))));

    config.apply_token_fallback(Some("env-token".to_owned()));
    config.validate().unwrap();
    assert_eq!(config.discord.bot_token, "env-token");
}

#[test]
fn saved_defaults_reload_identically() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("voxgate").join("config.toml");

    VoxConfig::default().save_to_file(&path).unwrap();
    let reloaded = VoxConfig::from_file(&path).unwrap();

    assert_eq!(
        toml::to_string(&reloaded).unwrap(),
        toml::to_string(&VoxConfig::default()).unwrap()
    );
}
