//! Configuration loaded from TOML.

use std::path::PathBuf;
use std::time::Duration;

use scriptsync_registry::{ServiceIdentity, DEFAULT_PORT};
use scriptsync_relay::DEFAULT_TTL;
use scriptsync_watch::{WatchTarget, DEFAULT_PATTERN};
use serde::{Deserialize, Serialize};

use crate::service::{ServiceSettings, DEFAULT_HEARTBEAT};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            service: ServiceConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Broadcast endpoint and coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where the port marker and spool live. Defaults to a directory under
    /// the system temp dir so every process on the machine agrees on it.
    #[serde(default)]
    pub coordination_dir: Option<PathBuf>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_relay_ttl_ms")]
    pub relay_ttl_ms: u64,
    /// How often a follower retries the election. Zero disables it.
    #[serde(default = "default_reelect_secs")]
    pub reelect_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            coordination_dir: None,
            heartbeat_secs: default_heartbeat_secs(),
            relay_ttl_ms: default_relay_ttl_ms(),
            reelect_secs: default_reelect_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn identity(&self) -> ServiceIdentity {
        let dir = self
            .coordination_dir
            .clone()
            .unwrap_or_else(ServiceIdentity::default_coordination_dir);
        ServiceIdentity::new(self.port, dir)
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            identity: self.identity(),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            relay_ttl: Duration::from_millis(self.relay_ttl_ms.max(MIN_RELAY_TTL_MS)),
        }
    }

    pub fn reelect_interval(&self) -> Option<Duration> {
        (self.reelect_secs > 0).then(|| Duration::from_secs(self.reelect_secs))
    }
}

/// What the synchronizer watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Pin a single script instead of matching `pattern` under `root`.
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            pattern: default_pattern(),
            target: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatchConfig {
    pub fn target(&self) -> WatchTarget {
        match &self.target {
            Some(script) => WatchTarget::Script(script.clone()),
            None => WatchTarget::Pattern {
                root: self.root.clone(),
                pattern: self.pattern.clone(),
            },
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Spool files younger than this are never deleted by their writer, so the
/// owner always gets a chance to pick them up.
const MIN_RELAY_TTL_MS: u64 = 100;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT.as_secs()
}

fn default_relay_ttl_ms() -> u64 {
    u64::try_from(DEFAULT_TTL.as_millis()).unwrap_or(5000)
}

fn default_reelect_secs() -> u64 {
    10
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

fn default_debounce_ms() -> u64 {
    100
}
