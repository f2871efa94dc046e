//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use radiolink_core::{Capability, LinkConfig, MacAddr, RetryPolicy};
use serde::Deserialize;

/// Hardware preset the emulated radio behaves like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioProfile {
    #[default]
    Esp32,
    Esp8266,
}

/// Daemon configuration. File: ~/.config/radiolink/config.toml or /etc/radiolink/config.toml.
/// Env overrides: RADIOLINK_MAC, RADIOLINK_PORT, RADIOLINK_CHANNEL, RADIOLINK_RETRY,
/// RADIOLINK_HUB, RADIOLINK_STORAGE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hardware address of this host; random locally-administered address when unset.
    #[serde(default)]
    pub mac: Option<MacAddr>,
    /// UDP port of the emulated air (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channel for directed joins (default 1).
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub radio: RadioProfile,
    /// Overrides the profile's highest channel (e.g. 13 in most of Europe).
    #[serde(default)]
    pub max_channel: Option<u8>,
    #[serde(default)]
    pub listen_timeout_ms: Option<u64>,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub pass_backoff_ms: u64,
    /// Scan passes: -1 forever, 0 once, n up to n passes.
    #[serde(default = "default_retry")]
    pub retry: RetryPolicy,
    /// Only this device ends a scan.
    #[serde(default)]
    pub hub: Option<MacAddr>,
    /// Received files are written under this directory.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Data bytes per FILE frame (default 200).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u8,
}

fn default_port() -> u16 {
    45680
}
fn default_channel() -> u8 {
    1
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u8 {
    3
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_retry() -> RetryPolicy {
    RetryPolicy::Once
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_chunk_size() -> u8 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mac: None,
            port: default_port(),
            channel: default_channel(),
            radio: RadioProfile::default(),
            max_channel: None,
            listen_timeout_ms: None,
            ack_timeout_ms: default_ack_timeout_ms(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            pass_backoff_ms: 0,
            retry: default_retry(),
            hub: None,
            storage_dir: default_storage_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Config {
    pub fn link_config(&self) -> LinkConfig {
        let mut capability = match self.radio {
            RadioProfile::Esp32 => Capability::esp32(),
            RadioProfile::Esp8266 => Capability::esp8266(),
        };
        if let Some(max) = self.max_channel {
            capability = capability.with_max_channel(max);
        }
        if let Some(ms) = self.listen_timeout_ms {
            capability = capability.with_listen_timeout(Duration::from_millis(ms));
        }
        let mut link = LinkConfig::new(capability);
        link.ack_timeout = Duration::from_millis(self.ack_timeout_ms);
        link.max_attempts = self.max_attempts.max(1);
        link.poll_interval = Duration::from_millis(self.poll_interval_ms);
        link.pass_backoff = Duration::from_millis(self.pass_backoff_ms);
        link
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(mac) = var("RADIOLINK_MAC").and_then(|s| s.parse().ok()) {
        c.mac = Some(mac);
    }
    if let Some(port) = var("RADIOLINK_PORT").and_then(|s| s.parse().ok()) {
        c.port = port;
    }
    if let Some(channel) = var("RADIOLINK_CHANNEL").and_then(|s| s.parse().ok()) {
        c.channel = channel;
    }
    if let Some(retry) = var("RADIOLINK_RETRY")
        .and_then(|s| s.parse::<i32>().ok())
        .and_then(|n| RetryPolicy::try_from(n).ok())
    {
        c.retry = retry;
    }
    if let Some(hub) = var("RADIOLINK_HUB").and_then(|s| s.parse().ok()) {
        c.hub = Some(hub);
    }
    if let Some(dir) = var("RADIOLINK_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(dir);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/radiolink/config.toml"));
    }
    out.push(PathBuf::from("/etc/radiolink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    load_path(&path)
}

/// Parse one config file. Unreadable or invalid files fall back to defaults.
pub fn load_path(path: &Path) -> Option<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
