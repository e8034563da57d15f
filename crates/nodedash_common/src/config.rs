//! Configuration management for nodedashd.
//!
//! Loads settings from /etc/nodedash/config.toml or uses defaults. Every field
//! has a default so partial files are fine.

use crate::error::NodedashError;
use crate::operation::STALE_AFTER_SECS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/nodedash/config.toml";

/// Default database location
pub const DEFAULT_DB_PATH: &str = "/var/lib/nodedash/nodedash.db";

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8420".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Event hub delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Frames buffered per subscriber before publishes start waiting
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Per-subscriber delivery timeout for topic publishes
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Per-subscriber delivery timeout for global broadcasts
    #[serde(default = "default_global_timeout")]
    pub global_timeout_ms: u64,

    /// Interval between heartbeats to every topic (0 disables)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_publish_timeout() -> u64 {
    500
}

fn default_global_timeout() -> u64 {
    100
}

fn default_heartbeat() -> u64 {
    15
}

impl HubConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    /// None when heartbeats are disabled
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            publish_timeout_ms: default_publish_timeout(),
            global_timeout_ms: default_global_timeout(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

/// Stale-operation sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_janitor_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    STALE_AFTER_SECS as u64
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

/// Self-update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Release channel recorded in update history
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Prints the available version (empty when up to date), optionally
    /// followed by a second line with the version installed on disk
    #[serde(default = "default_check_command")]
    pub check_command: String,

    /// Fetches, verifies and installs the given version; receives it as the
    /// last argument and reports progress on stdout
    #[serde(default = "default_apply_command")]
    pub apply_command: String,

    /// Wait for in-flight responses before checkpointing
    #[serde(default = "default_flush_grace")]
    pub flush_grace_secs: u64,

    /// Wait after the checkpoint for filesystem durability
    #[serde(default = "default_durability_grace")]
    pub durability_grace_secs: u64,

    /// Delay before exiting on restart-for-update
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

fn default_channel() -> String {
    "stable".to_string()
}

fn default_check_command() -> String {
    "/usr/lib/nodedash/update-check".to_string()
}

fn default_apply_command() -> String {
    "/usr/lib/nodedash/update-apply".to_string()
}

fn default_flush_grace() -> u64 {
    3
}

fn default_durability_grace() -> u64 {
    2
}

fn default_restart_delay() -> u64 {
    2
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            check_command: default_check_command(),
            apply_command: default_apply_command(),
            flush_grace_secs: default_flush_grace(),
            durability_grace_secs: default_durability_grace(),
            restart_delay_secs: default_restart_delay(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub janitor: JanitorConfig,

    #[serde(default)]
    pub update: UpdateConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            hub: HubConfig::default(),
            janitor: JanitorConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            warn!("Config not loaded from {}, using defaults: {}", path.display(), e);
            Config::default()
        })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, NodedashError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, NodedashError> {
        toml::from_str(content).map_err(|e| NodedashError::Config(e.to_string()))
    }
}
