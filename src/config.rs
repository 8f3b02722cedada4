use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::Error;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Longest total cache window accepted: `max_age_ms + max_stale_ms`.
///
/// mini-moka refuses a time-to-live over 1000 (365-day) years, which is also
/// well inside the `i64` range of a Redis `PX` argument.
pub const MAX_CACHE_WINDOW_MS: u64 = 1_000 * 365 * 24 * HOUR_MS;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Fully resolved service configuration.
///
/// Every section has defaults, so an empty YAML document yields a working
/// memory-backed setup talking to `api.github.com`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3001`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:3001".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the forge API root (e.g. `https://api.github.com`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Name of the environment variable that holds the API token.
    ///
    /// Unauthenticated requests work but get a much smaller rate-limit quota.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// `User-Agent` sent with every API request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Transport-level timeout for a single API request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Optional upper bound on a single rate-limit back-off, in seconds.
    ///
    /// Unset means the delay the forge asks for is always honoured.
    #[serde(default)]
    pub max_retry_delay_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            auth_token_env: default_auth_token_env(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retry_delay_secs: None,
        }
    }
}

impl UpstreamConfig {
    /// Read the API token from the configured environment variable.
    pub fn auth_token(&self) -> Option<String> {
        std::env::var(&self.auth_token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_auth_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_user_agent() -> String {
    format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Which [`crate::cache::CacheStore`] implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Bounded in-process store.  Not shared between instances.
    #[default]
    Memory,
    /// Networked Redis / KeyDB store shared by every instance.
    #[serde(alias = "keydb", alias = "networked")]
    Redis,
}

impl CacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub backend: CacheBackend,
    /// Milliseconds an entry is served without revalidation.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    /// Milliseconds past `max_age_ms` a stale entry is kept for revalidation.
    #[serde(default = "default_max_stale_ms")]
    pub max_stale_ms: u64,
    /// Entry bound for the memory backend.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Connection settings; required when `type: redis`.
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl CacheConfig {
    /// `max_age_ms + max_stale_ms`, or `None` when it exceeds
    /// [`MAX_CACHE_WINDOW_MS`].
    pub fn window_ms(&self) -> Option<u64> {
        self.max_age_ms
            .checked_add(self.max_stale_ms)
            .filter(|window| *window <= MAX_CACHE_WINDOW_MS)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            max_age_ms: default_max_age_ms(),
            max_stale_ms: default_max_stale_ms(),
            capacity: default_capacity(),
            redis: None,
        }
    }
}

fn default_max_age_ms() -> u64 {
    HOUR_MS
}

fn default_max_stale_ms() -> u64 {
    HOUR_MS + MINUTE_MS
}

fn default_capacity() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the auth token.
    #[serde(default = "default_redis_auth_env")]
    pub auth_token_env: String,
    /// Prepended to every key so deployments can share one server.
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_redis_auth_env() -> String {
    "REDIS_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML document.  Blank input yields the defaults.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("failed to parse config YAML")?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<(), Error> {
    if config.cache.max_age_ms == 0 {
        return Err(Error::Configuration("cache.max_age_ms must be > 0".into()));
    }
    if config.cache.window_ms().is_none() {
        return Err(Error::Configuration(format!(
            "cache.max_age_ms + cache.max_stale_ms must not exceed {MAX_CACHE_WINDOW_MS}"
        )));
    }
    if config.cache.backend == CacheBackend::Memory && config.cache.capacity == 0 {
        return Err(Error::Configuration("cache.capacity must be > 0".into()));
    }
    if config.upstream.api_url.trim().is_empty() {
        return Err(Error::Configuration("upstream.api_url must be set".into()));
    }
    if config.cache.backend == CacheBackend::Redis {
        match &config.cache.redis {
            None => {
                return Err(Error::Configuration(
                    "cache.type is redis but cache.redis is missing".into(),
                ))
            }
            Some(redis) if redis.endpoint.trim().is_empty() => {
                return Err(Error::Configuration(
                    "cache.redis.endpoint must be set".into(),
                ))
            }
            Some(redis) if redis.pool_size == 0 => {
                return Err(Error::Configuration(
                    "cache.redis.pool_size must be > 0".into(),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
