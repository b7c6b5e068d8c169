//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by the binary)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::command::DEFAULT_AUTO_LOCK_SECONDS;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier used as metrics label and in the event feed
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "access-engine".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Deadline for a single command/query invocation
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_auto_lock_seconds")]
    pub default_auto_lock_seconds: u64,
    /// Re-read-and-retry budget on door version conflicts
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
    #[serde(default = "default_stats_window_days")]
    pub stats_window_days: i64,
    #[serde(default = "default_recent_events_limit")]
    pub recent_events_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            default_auto_lock_seconds: default_auto_lock_seconds(),
            cas_retries: default_cas_retries(),
            stats_window_days: default_stats_window_days(),
            recent_events_limit: default_recent_events_limit(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_auto_lock_seconds() -> u64 {
    DEFAULT_AUTO_LOCK_SECONDS
}

fn default_cas_retries() -> u32 {
    3
}

fn default_stats_window_days() -> i64 {
    30
}

fn default_recent_events_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelockConfig {
    /// Run the temp-unlock re-lock timer in-process
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for RelockConfig {
    fn default() -> Self {
        Self { enabled: true, queue_size: default_queue_size() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSONL file receiving access events and audit entries
    #[serde(default = "default_feed_file")]
    pub file: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { enabled: true, file: default_feed_file(), queue_size: default_queue_size() }
    }
}

fn default_feed_file() -> String {
    "access_feed.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Interval for the metrics log line and feed snapshot
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    /// Optional JSON seed loaded into the in-memory store at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_queue_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub relock: RelockConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bind_address: String,
    port: u16,
    command_timeout_ms: u64,
    default_auto_lock_seconds: u64,
    cas_retries: u32,
    stats_window_days: i64,
    recent_events_limit: usize,
    relock_enabled: bool,
    relock_queue_size: usize,
    feed_enabled: bool,
    feed_file: String,
    feed_queue_size: usize,
    metrics_interval_secs: u64,
    seed_file: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            bind_address: toml_config.server.bind_address,
            port: toml_config.server.port,
            command_timeout_ms: toml_config.engine.command_timeout_ms,
            default_auto_lock_seconds: toml_config.engine.default_auto_lock_seconds,
            cas_retries: toml_config.engine.cas_retries,
            stats_window_days: toml_config.engine.stats_window_days,
            recent_events_limit: toml_config.engine.recent_events_limit,
            relock_enabled: toml_config.relock.enabled,
            relock_queue_size: toml_config.relock.queue_size,
            feed_enabled: toml_config.feed.enabled,
            feed_file: toml_config.feed.file,
            feed_queue_size: toml_config.feed.queue_size,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            seed_file: toml_config.store.seed_file,
            config_file,
        }
    }

    /// Config file path: the command line choice, else `CONFIG_FILE`, else the dev config
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.command_timeout_ms > 0, "engine.command_timeout_ms must be positive");
        anyhow::ensure!(
            self.default_auto_lock_seconds > 0,
            "engine.default_auto_lock_seconds must be positive"
        );
        anyhow::ensure!(self.stats_window_days > 0, "engine.stats_window_days must be positive");
        anyhow::ensure!(self.relock_queue_size > 0, "relock.queue_size must be positive");
        anyhow::ensure!(self.feed_queue_size > 0, "feed.queue_size must be positive");
        anyhow::ensure!(self.metrics_interval_secs > 0, "metrics.interval_secs must be positive");
        Ok(())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(cli_path: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli_path))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn command_timeout_ms(&self) -> u64 {
        self.command_timeout_ms
    }

    pub fn default_auto_lock_seconds(&self) -> u64 {
        self.default_auto_lock_seconds
    }

    pub fn cas_retries(&self) -> u32 {
        self.cas_retries
    }

    pub fn stats_window_days(&self) -> i64 {
        self.stats_window_days
    }

    pub fn recent_events_limit(&self) -> usize {
        self.recent_events_limit
    }

    pub fn relock_enabled(&self) -> bool {
        self.relock_enabled
    }

    pub fn relock_queue_size(&self) -> usize {
        self.relock_queue_size
    }

    pub fn feed_enabled(&self) -> bool {
        self.feed_enabled
    }

    pub fn feed_file(&self) -> &str {
        &self.feed_file
    }

    pub fn feed_queue_size(&self) -> usize {
        self.feed_queue_size
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn seed_file(&self) -> Option<&str> {
        self.seed_file.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the invocation deadline
    pub fn with_command_timeout_ms(mut self, ms: u64) -> Self {
        self.command_timeout_ms = ms;
        self
    }
}
