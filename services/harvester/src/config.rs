//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Upstream tokens come from HARVEST_TOKENS (comma-separated), then
//! `tokens_file` (one per line), then the inline `tokens` list.

use common::Secret;
use orchestration::{CompletionPolicy, Schedule};
use resilient_client::RetryPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collectors::JobKind;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Upstream provider settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    tokens: Vec<String>,
    /// File with one token per line (alternative to HARVEST_TOKENS)
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    /// Resolved tokens, never deserialized directly
    #[serde(skip)]
    pub credentials: Vec<Secret<String>>,
}

/// Token bucket shared by every upstream call
#[derive(Debug, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_rate_limit_step_ms")]
    pub rate_limit_step_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Probation before an unhealthy credential is selected again
    #[serde(default = "default_unhealthy_retry_secs")]
    pub unhealthy_retry_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub policy: CompletionPolicy,
    /// Concurrent sub-calls per unit, 0 for unbounded
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Pause between items of a batched job
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,
    /// Resource codes per batch item
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Admin / control HTTP surface
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// One scheduled collection job
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub kind: JobKind,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_capacity() -> usize {
    200
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_rate_limit_step_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_unhealthy_retry_secs() -> u64 {
    600
}

fn default_max_in_flight() -> usize {
    4
}

fn default_item_delay_ms() -> u64 {
    200
}

fn default_batch_size() -> usize {
    50
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

fn default_enabled() -> bool {
    true
}

fn default_lookback_days() -> u32 {
    1
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            rate_limit_step_ms: default_rate_limit_step_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            unhealthy_retry_secs: default_unhealthy_retry_secs(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: CompletionPolicy::default(),
            max_in_flight: default_max_in_flight(),
            item_delay_ms: default_item_delay_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl LimiterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::with_delays(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.rate_limit_step_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn config_err(msg: impl Into<String>) -> common::Error {
    common::Error::Config(msg.into())
}

/// Split, trim and drop blanks and `#` comments.
fn parse_tokens<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<Secret<String>> {
    raw.map(str::trim)
        .filter(|t| !t.is_empty() && !t.starts_with('#'))
        .map(|t| Secret::new(t.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// Token resolution order:
    /// 1. HARVEST_TOKENS env var
    /// 2. tokens_file path from config
    /// 3. inline tokens
    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Ok(raw) = std::env::var("HARVEST_TOKENS") {
            config.upstream.credentials = parse_tokens(raw.split(','));
        } else if let Some(ref tokens_file) = config.upstream.tokens_file {
            let raw = std::fs::read_to_string(tokens_file).map_err(|e| {
                config_err(format!(
                    "failed to read tokens_file {}: {e}",
                    tokens_file.display()
                ))
            })?;
            config.upstream.credentials = parse_tokens(raw.lines());
        } else {
            config.upstream.credentials =
                parse_tokens(config.upstream.tokens.iter().map(String::as_str));
        }
        config.upstream.tokens.clear();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = &self.upstream.url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(config_err(format!(
                "upstream.url must start with http:// or https://, got: {url}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(config_err("upstream.timeout_secs must be greater than 0"));
        }
        if self.upstream.credentials.is_empty() {
            return Err(config_err(
                "no upstream tokens: set HARVEST_TOKENS, upstream.tokens_file or upstream.tokens",
            ));
        }
        if self.limiter.capacity == 0 {
            return Err(config_err("limiter.capacity must be greater than 0"));
        }
        if self.limiter.interval_ms == 0 {
            return Err(config_err("limiter.interval_ms must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_err("retry.max_attempts must be greater than 0"));
        }
        if self.orchestrator.batch_size == 0 {
            return Err(config_err("orchestrator.batch_size must be greater than 0"));
        }
        if self.admin.max_connections == 0 {
            return Err(config_err("admin.max_connections must be greater than 0"));
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(config_err("job name must not be empty"));
            }
            if !names.insert(job.name.as_str()) {
                return Err(config_err(format!("duplicate job name: {}", job.name)));
            }
            Schedule::parse(&job.schedule)
                .map_err(|e| config_err(format!("job {}: {e}", job.name)))?;
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("market-harvester.toml")
    }
}
