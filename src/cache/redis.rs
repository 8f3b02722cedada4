//! Networked cache backed by Redis / KeyDB.
//!
//! Records are JSON `{"value": ..., "createdAt": <ms>}` written with
//! `SET key value PX <max_age + max_stale>`, so the server drops them once the
//! stale window closes.  Staleness is computed here, on read, with the same
//! [`Freshness`] rules as the memory backend.

use std::sync::Arc;

use anyhow::Context;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration};
use tracing::{trace, warn};

use crate::config::{CacheBackend, RedisConfig};
use crate::error::{Error, Result};

use super::{CacheStore, CachedManifest, Clock, Freshness, Lookup, StoredEntry};

pub struct RedisStore {
    pool: Pool,
    endpoint: String,
    key_prefix: String,
    freshness: Freshness,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect a pool described by `config` and verify it with a PING.
    ///
    /// The auth token is read from the environment variable named in
    /// `config.auth_token_env`.  TLS uses `rustls` via fred.
    pub async fn connect(
        config: &RedisConfig,
        freshness: Freshness,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = create_pool(config)
            .await
            .map_err(|e| Error::cache("connect", &config.endpoint, format!("{e:#}")))?;
        Ok(Self::from_pool(pool, config, freshness, clock))
    }

    /// Wrap an already initialised pool.
    pub fn from_pool(
        pool: Pool,
        config: &RedisConfig,
        freshness: Freshness,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            endpoint: config.endpoint.clone(),
            key_prefix: config.key_prefix.clone(),
            freshness,
            clock,
        }
    }

    fn prefixed(&self, key: &str) -> String {
        prefixed_key(&self.key_prefix, key)
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let raw: Option<String> = self
            .pool
            .get(self.prefixed(key))
            .await
            .map_err(|e| Error::cache("GET", key, e))?;
        let Some(raw) = raw else {
            return Ok(Lookup::miss());
        };
        let Some(entry) = decode_record(key, &raw) else {
            return Ok(Lookup::miss());
        };
        trace!(key, "redis cache hit");
        Ok(self.freshness.lookup(entry, self.clock.now_millis()))
    }

    async fn set(&self, key: &str, value: CachedManifest) -> Result<()> {
        let record = StoredEntry {
            value,
            created_at: self.clock.now_millis(),
        };
        let payload =
            serde_json::to_string(&record).map_err(|e| Error::cache("SET", key, e))?;
        let ttl_ms = i64::try_from(self.freshness.ttl_ms()).unwrap_or(i64::MAX);
        let _: () = self
            .pool
            .set(
                self.prefixed(key),
                payload,
                Some(Expiration::PX(ttl_ms)),
                None,
                false,
            )
            .await
            .map_err(|e| Error::cache("SET", key, e))?;
        trace!(key, ttl_ms, "redis cache set");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self
            .pool
            .ping(None)
            .await
            .map_err(|e| Error::cache("PING", &self.endpoint, e))?;
        Ok(())
    }

    fn backend(&self) -> CacheBackend {
        CacheBackend::Redis
    }
}

// ---------------------------------------------------------------------------
// Pool setup
// ---------------------------------------------------------------------------

async fn create_pool(config: &RedisConfig) -> anyhow::Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may carry a `redis://` or `rediss://` scheme; `rediss`
    // implies TLS even when the flag is off.
    let tls = config.tls || config.endpoint.starts_with("rediss://");
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };
    if tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build redis connection pool")?;
    pool.init().await.context("failed to connect to redis")?;
    let _: String = pool
        .ping(None)
        .await
        .context("redis PING failed after connect")?;

    tracing::info!(
        host,
        port,
        tls,
        pool_size = config.pool_size,
        prefix = %config.key_prefix,
        "redis cache pool created"
    );
    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> anyhow::Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// Decode a stored record.  Records written by something else are treated
/// as a miss so the next fetch overwrites them.
fn decode_record(key: &str, raw: &str) -> Option<StoredEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable redis cache record");
            None
        }
    }
}
