//! Configuration loading and runtime paths.
//!
//! Loads `config.toml` from the runtime directory (`~/.wabridge/` unless
//! overridden). Every section is optional. Environment variables override file
//! values; file values override defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sidecar connection settings.
    pub network: NetworkConfig,

    /// Session lifecycle and reconnection settings.
    pub session: SessionConfig,

    /// Command API settings.
    pub commands: CommandsConfig,

    /// Media pipeline settings.
    pub media: MediaConfig,
}

/// Sidecar connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of the protocol sidecar.
    pub base_url: String,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Timeout for ordinary requests in seconds.
    pub request_timeout_secs: u64,

    /// Long-poll timeout for the event stream in seconds.
    pub poll_timeout_secs: u64,

    /// How long one pairing attempt may wait for a scan, in seconds.
    pub pairing_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_owned(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            poll_timeout_secs: 60,
            pairing_timeout_secs: 120,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// First reconnection delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Reconnection delay cap in milliseconds.
    pub max_backoff_ms: u64,

    /// Terminal auth failures tolerated before giving up on a credential.
    pub max_auth_attempts: u32,

    /// Capacity of the inbound event queue.
    pub event_buffer: usize,

    /// Capacity of the outbound send queue.
    pub send_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_auth_attempts: 3,
            event_buffer: 1_024,
            send_queue: 64,
        }
    }
}

/// Command API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Default deadline for one send or download, in seconds.
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Media pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Explicit ffmpeg binary; `PATH` is searched when unset.
    pub ffmpeg_path: Option<String>,

    /// Target Opus bitrate for voice notes (ffmpeg syntax, e.g. `32k`).
    pub voice_bitrate: String,

    /// Target sample rate for voice notes in Hz.
    pub voice_sample_rate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            voice_bitrate: "32k".to_owned(),
            voice_sample_rate: 24_000,
        }
    }
}

impl Config {
    /// Load `config.toml` from `path` and apply process environment overrides.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = load_config(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through a resolver (injectable for tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WABRIDGE_URL") {
            self.network.base_url = v;
        }
        if let Some(v) = env("WABRIDGE_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.commands.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "WABRIDGE_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("WABRIDGE_FFMPEG") {
            self.media.ffmpeg_path = Some(v);
        }
    }
}

/// Parse the config file, returning defaults when it does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read config at {}: {e}",
            path.display()
        )),
    }
}

/// Resolve the default runtime directory (`~/.wabridge/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".wabridge"))
}

/// Filesystem layout of the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Runtime root directory.
    pub root: PathBuf,
    /// `config.toml`.
    pub config_file: PathBuf,
    /// SQLite database with chats, messages and media metadata.
    pub database: PathBuf,
    /// Opaque credential file.
    pub credential_file: PathBuf,
    /// Downloaded media cache.
    pub media_dir: PathBuf,
    /// Converted voice notes waiting to be (or already) sent.
    pub outbox_dir: PathBuf,
    /// Rolling log files.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Lay out runtime files under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_file: root.join("config.toml"),
            database: root.join("bridge.db"),
            credential_file: root.join("credential"),
            media_dir: root.join("media"),
            outbox_dir: root.join("outbox"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Resolve runtime paths under [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(config_dir()?))
}
