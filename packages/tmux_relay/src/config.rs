use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [push]
//                    reconnect_delay_seconds = 2
//
//   env var:         TMUX_RELAY_PUSH__RECONNECT_DELAY_SECONDS=2
//
// Double underscore nests into a section; single underscores stay in field names.

pub const ENV_PREFIX: &str = "TMUX_RELAY_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub push: PushFileConfig,
    #[serde(default)]
    pub notify: NotifyFileConfig,
}

/// Listener and socket tuning (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u32,
    #[serde(default = "default_chunk_ttl_secs")]
    pub chunk_ttl_secs: u64,
    #[serde(default = "default_history_timeout_ms")]
    pub history_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_tmux_bin")]
    pub tmux_bin: String,
    #[serde(default = "default_ssh_bin")]
    pub ssh_bin: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_frame_bytes: default_max_frame_bytes(),
            heartbeat_ms: default_heartbeat_ms(),
            chunk_ttl_secs: default_chunk_ttl_secs(),
            history_timeout_ms: default_history_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            tmux_bin: default_tmux_bin(),
            ssh_bin: default_ssh_bin(),
        }
    }
}

/// Background watcher tuning (`[push]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushFileConfig {
    #[serde(default = "default_push_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_fast_retries")]
    pub reconnect_max_fast_retries: u32,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_reconnect_slow_interval_seconds")]
    pub reconnect_slow_interval_seconds: u64,
    /// Base URL used for deep links in notifications.
    #[serde(default)]
    pub site_url: Option<String>,
    /// How often targets.toml is re-read for added, removed or edited
    /// targets. Zero turns the sync off.
    #[serde(default = "default_target_sync_seconds")]
    pub target_sync_seconds: u64,
}

impl Default for PushFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_push_enabled(),
            reconnect_max_fast_retries: default_max_fast_retries(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            reconnect_slow_interval_seconds: default_reconnect_slow_interval_seconds(),
            site_url: None,
            target_sync_seconds: default_target_sync_seconds(),
        }
    }
}

/// Where notifications go (`[notify]`). Without a webhook they are logged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotifyFileConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_max_frame_bytes() -> u32 {
    1024 * 1024
}
fn default_heartbeat_ms() -> u32 {
    30_000
}
fn default_chunk_ttl_secs() -> u64 {
    30
}
fn default_history_timeout_ms() -> u64 {
    3_000
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_tmux_bin() -> String {
    "tmux".to_string()
}
fn default_ssh_bin() -> String {
    "ssh".to_string()
}
fn default_push_enabled() -> bool {
    true
}
fn default_max_fast_retries() -> u32 {
    5
}
fn default_reconnect_delay_seconds() -> u64 {
    5
}
fn default_reconnect_slow_interval_seconds() -> u64 {
    60
}
fn default_target_sync_seconds() -> u64 {
    30
}

/// Build a figment that layers: defaults → config.toml → TMUX_RELAY_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Socket and session-link settings (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_frame_bytes: u32,
    pub heartbeat_ms: u32,
    pub chunk_ttl: Duration,
    pub history_timeout: Duration,
    pub connect_timeout: Duration,
    pub tmux_bin: String,
    pub ssh_bin: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            bind_addr: format!("{}:{}", fc.host, fc.port),
            max_frame_bytes: fc.max_frame_bytes,
            heartbeat_ms: fc.heartbeat_ms,
            chunk_ttl: Duration::from_secs(fc.chunk_ttl_secs.max(1)),
            history_timeout: Duration::from_millis(fc.history_timeout_ms),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs.max(1)),
            tmux_bin: fc.tmux_bin.clone(),
            ssh_bin: fc.ssh_bin.clone(),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.bind_addr))
    }
}

/// Reconnect policy for the push supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_fast_retries: u32,
    pub fast_delay: Duration,
    pub slow_interval: Duration,
}

impl ReconnectPolicy {
    pub fn from_file(fc: &PushFileConfig) -> Self {
        Self {
            max_fast_retries: fc.reconnect_max_fast_retries,
            fast_delay: Duration::from_secs(fc.reconnect_delay_seconds),
            slow_interval: Duration::from_secs(fc.reconnect_slow_interval_seconds),
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayPaths {
    pub data_dir: PathBuf,
}

impl RelayPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".tmux-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn targets_path(&self) -> PathBuf {
        self.data_dir.join("targets.toml")
    }
}
