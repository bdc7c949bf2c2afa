//! Configuration management
//!
//! Layers, lowest to highest priority: built-in defaults, an optional TOML
//! file, then `MARKET_DAEMON__SECTION__KEY` environment variables.

use crate::error::{DaemonError, Result};
use crate::schedule::{parse_schedule, Schedule};
use crate::types::{TokenAmount, MAX_DURATION_DAYS};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MARKET_DAEMON";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub news: NewsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub creator: CreatorConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Interval (`30m`, `6h`, milliseconds) or five-field cron expression
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Stop after this many cycles
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_markets_per_round")]
    pub markets_per_round: u32,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Run the first cycle as soon as the daemon starts
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    /// Pause between creations within a cycle
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Recent news items handed to question generation
    #[serde(default = "default_news_context_limit")]
    pub news_context_limit: usize,
    #[serde(default = "default_duration_days")]
    pub duration_days: u32,
    /// Base units of the collateral token
    #[serde(default = "default_initial_liquidity")]
    pub initial_liquidity: TokenAmount,
}

fn default_schedule() -> String {
    "30m".to_string()
}
fn default_markets_per_round() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_pacing_ms() -> u64 {
    2_000
}
fn default_news_context_limit() -> usize {
    10
}
fn default_duration_days() -> u32 {
    30
}
fn default_initial_liquidity() -> TokenAmount {
    TokenAmount::new(1_000_000_000)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            max_iterations: None,
            markets_per_round: default_markets_per_round(),
            dry_run: true,
            run_on_start: true,
            pacing_ms: default_pacing_ms(),
            news_context_limit: default_news_context_limit(),
            duration_days: default_duration_days(),
            initial_liquidity: default_initial_liquidity(),
        }
    }
}

impl DaemonConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file (`~` is expanded) or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "~/.market-daemon/markets.db".to_string()
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_min_score")]
    pub min_score: u8,
    #[serde(default)]
    pub sources: Vec<FeedSourceConfig>,
}

fn default_poll_interval_secs() -> u64 {
    300
}
fn default_buffer_size() -> usize {
    100
}
fn default_min_score() -> u8 {
    crate::news::DEFAULT_MIN_SCORE
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: default_poll_interval_secs(),
            buffer_size: default_buffer_size(),
            min_score: default_min_score(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSourceConfig {
    pub name: String,
    /// JSON Feed URL
    pub url: String,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_trust_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Require `Authorization: Bearer <token>` when set
    #[serde(default, skip_serializing)]
    pub bearer_token: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatorConfig {
    /// Market creation service URL, required unless running dry
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_creator_timeout")]
    pub timeout_secs: u64,
}

fn default_creator_timeout() -> u64 {
    30
}

impl Default for CreatorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_creator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter, `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `path` (optional) plus environment overrides, then validate
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(env_source())
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.markets_per_round == 0 {
            return Err(DaemonError::Config(
                "daemon.markets_per_round must be greater than 0".into(),
            ));
        }
        if let Schedule::Cron(expr) = parse_schedule(&self.daemon.schedule)? {
            expr.validate()?;
        }
        if self.daemon.duration_days == 0 || self.daemon.duration_days > MAX_DURATION_DAYS {
            return Err(DaemonError::Config(format!(
                "daemon.duration_days must be between 1 and {}",
                MAX_DURATION_DAYS
            )));
        }

        for source in &self.news.sources {
            if source.name.trim().is_empty() || source.url.trim().is_empty() {
                return Err(DaemonError::Config(
                    "news.sources entries need a name and url".into(),
                ));
            }
            if !source.trust_weight.is_finite() || source.trust_weight <= 0.0 {
                return Err(DaemonError::Config(format!(
                    "news source '{}' trust_weight must be greater than 0",
                    source.name
                )));
            }
        }
        if self.news.poll_interval_secs == 0 {
            return Err(DaemonError::Config(
                "news.poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.webhook.enabled && self.webhook.bind.parse::<SocketAddr>().is_err() {
            return Err(DaemonError::Config(format!(
                "webhook.bind '{}' is not a socket address",
                self.webhook.bind
            )));
        }

        let has_endpoint = self
            .creator
            .endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        if !self.daemon.dry_run && !has_endpoint {
            return Err(DaemonError::Config(
                "creator.endpoint is required when dry_run is false".into(),
            ));
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.shutdown_timeout_secs)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
