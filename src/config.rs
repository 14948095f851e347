//! Configuration loading and validation.
//!
//! Loaded from TOML (`--config`, `$CAMPAIGN_DISPATCH_CONFIG`, or
//! `~/.campaign-dispatch/config.toml`). Precedence: env vars > file > defaults.
//! A missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Env var naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "CAMPAIGN_DISPATCH_CONFIG";
/// Env var overriding `database.path`.
pub const DATABASE_PATH_ENV: &str = "CAMPAIGN_DISPATCH_DB";
/// Env var overriding `provider.base_url`.
pub const PROVIDER_URL_ENV: &str = "CAMPAIGN_DISPATCH_PROVIDER_URL";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database settings.
    pub database: DatabaseConfig,
    /// Run scheduler loop settings.
    pub scheduler: SchedulerConfig,
    /// Send queue dispatcher loop settings.
    pub dispatcher: DispatcherConfig,
    /// Daily quota defaults.
    pub quota: QuotaConfig,
    /// External messaging provider settings.
    pub provider: ProviderConfig,
    /// Event notifier settings.
    pub events: EventsConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// SQLite database settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `~/.campaign-dispatch/dispatch.db`.
    pub path: Option<PathBuf>,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 4,
        }
    }
}

/// Run scheduler loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between polls for due runs.
    pub interval_secs: u64,
    /// Maximum runs claimed per poll.
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 10,
        }
    }
}

impl SchedulerConfig {
    /// Poll period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Send queue dispatcher loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between polls of the send queue.
    pub interval_secs: u64,
    /// Maximum queue entries processed per poll.
    pub batch_size: u32,
    /// Attempts before an entry becomes a terminal failure.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further attempt.
    pub backoff_base_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            batch_size: 20,
            max_attempts: 3,
            backoff_base_secs: 5,
        }
    }
}

impl DispatcherConfig {
    /// Poll period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Daily quota defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Limit applied to a scope that has no quota plan.
    pub default_daily_limit: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: 1000,
        }
    }
}

/// External messaging provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the Graph-style messages API.
    pub base_url: String,
    /// API version path segment.
    pub api_version: String,
    /// Request timeout for one send.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_owned(),
            api_version: "v19.0".to_owned(),
            request_timeout_secs: 30,
        }
    }
}

/// Event notifier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer; slow subscribers lag past this many events.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Defaults to `~/.campaign-dispatch/logs`.
    pub dir: Option<PathBuf>,
    /// `tracing` filter directive for `start` when `RUST_LOG` is unset.
    pub level: Option<String>,
}

impl LoggingConfig {
    /// Configured directive, or [`crate::logging::DEFAULT_DIRECTIVE`].
    pub fn directive(&self) -> &str {
        self.level
            .as_deref()
            .unwrap_or(crate::logging::DEFAULT_DIRECTIVE)
    }
}

impl Config {
    /// Load configuration: explicit path, else `$CAMPAIGN_DISPATCH_CONFIG`,
    /// else the default location. Env overrides are applied afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the result fails [`Config::validate`].
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) => PathBuf::from(p),
                Err(_) => config_dir()?.join("config.toml"),
            },
        };
        let mut config = load_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config (no env overrides, no validation).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides using the given resolver.
    ///
    /// Takes a resolver function so tests never mutate the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env(DATABASE_PATH_ENV) {
            self.database.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env(PROVIDER_URL_ENV) {
            self.provider.base_url = v;
        }
        if let Some(v) = env("CAMPAIGN_DISPATCH_QUOTA_DEFAULT") {
            match v.parse() {
                Ok(n) => self.quota.default_daily_limit = n,
                Err(_) => tracing::warn!(
                    var = "CAMPAIGN_DISPATCH_QUOTA_DEFAULT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Reject values that would stall or spin the loops.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        let checks: [(&str, bool); 7] = [
            ("scheduler.interval_secs", self.scheduler.interval_secs > 0),
            ("scheduler.batch_size", self.scheduler.batch_size > 0),
            ("dispatcher.interval_secs", self.dispatcher.interval_secs > 0),
            ("dispatcher.batch_size", self.dispatcher.batch_size > 0),
            ("dispatcher.max_attempts", self.dispatcher.max_attempts > 0),
            (
                "dispatcher.backoff_base_secs",
                self.dispatcher.backoff_base_secs > 0,
            ),
            ("events.channel_capacity", self.events.channel_capacity > 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, ok)| !ok) {
            anyhow::bail!("{field} must be greater than zero");
        }
        if self.quota.default_daily_limit < 0 {
            anyhow::bail!("quota.default_daily_limit must not be negative");
        }
        url::Url::parse(&self.provider.base_url)
            .with_context(|| format!("invalid provider.base_url {:?}", self.provider.base_url))?;
        tracing_subscriber::EnvFilter::try_new(self.logging.directive())
            .with_context(|| format!("invalid logging.level {:?}", self.logging.directive()))?;
        Ok(())
    }

    /// Resolved database file path.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the home directory
    /// cannot be determined.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database.path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("dispatch.db")),
        }
    }

    /// Resolved log directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.logging.dir {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("logs")),
        }
    }
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read config at {}: {e}",
            path.display()
        )),
    }
}

/// Resolve the default config directory (`~/.campaign-dispatch/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".campaign-dispatch"))
}
