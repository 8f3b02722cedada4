//! Manifest cache stores.
//!
//! A [`CacheStore`] maps a cache key to the last fetched manifest and its
//! revalidation token.  Entries are stamped with their write time; whether an
//! entry is stale is computed on every read by [`Freshness`], never stored.
//! Records older than `max_age + max_stale` are gone: backends hand the
//! combined window to their native expiry and the read path rejects anything
//! older that is still lingering.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{Error, Result};

pub use memory::MemoryStore;
pub use redis::RedisStore;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Cached payload: the parsed manifest and the token used to revalidate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedManifest {
    pub pkg: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Record as held by a backend.  Also the Redis wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: CachedManifest,
    /// Unix timestamp (milliseconds) of the write.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Result of [`CacheStore::get`].  `value` is `None` on a miss.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookup {
    pub value: Option<CachedManifest>,
    pub stale: bool,
}

impl Lookup {
    pub fn miss() -> Self {
        Self::default()
    }

    /// Present and within `max_age`.
    #[cfg(test)]
    pub fn is_fresh(&self) -> bool {
        self.value.is_some() && !self.stale
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Source of "now" for freshness math.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Freshness window shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub max_age_ms: u64,
    pub max_stale_ms: u64,
}

impl Freshness {
    pub fn new(max_age_ms: u64, max_stale_ms: u64) -> Self {
        Self {
            max_age_ms,
            max_stale_ms,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_age_ms, config.max_stale_ms)
    }

    /// Total lifetime of a record: `max_age + max_stale`.
    pub fn ttl_ms(&self) -> u64 {
        self.max_age_ms.saturating_add(self.max_stale_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms())
    }

    pub fn is_stale(&self, created_at: i64, now: i64) -> bool {
        age(created_at, now) > self.max_age_ms
    }

    pub fn is_expired(&self, created_at: i64, now: i64) -> bool {
        age(created_at, now) > self.ttl_ms()
    }

    /// Turn a stored record into a [`Lookup`] as seen at `now`.
    pub fn lookup(&self, entry: StoredEntry, now: i64) -> Lookup {
        if self.is_expired(entry.created_at, now) {
            return Lookup::miss();
        }
        Lookup {
            stale: self.is_stale(entry.created_at, now),
            value: Some(entry.value),
        }
    }
}

fn age(created_at: i64, now: i64) -> u64 {
    // A record from the future (clock skew between instances) is brand new.
    u64::try_from(now.saturating_sub(created_at)).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Key → manifest storage with time-based expiry.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up `key`.  A miss is `Ok(Lookup::miss())`, never an error.
    async fn get(&self, key: &str) -> Result<Lookup>;

    /// Store `value` under `key`, stamped with the current time.
    async fn set(&self, key: &str, value: CachedManifest) -> Result<()>;

    /// Cheap connectivity probe for health checks.
    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> CacheBackend;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured [`CacheStore`].
///
/// Fails with [`Error::Configuration`] when the cache window is too large for
/// the backends, or the Redis backend is selected without connection
/// settings, before any connection attempt is made.
pub async fn build_store(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CacheStore>> {
    if config.window_ms().is_none() {
        return Err(Error::Configuration(
            "cache.max_age_ms + cache.max_stale_ms is too large".into(),
        ));
    }
    let freshness = Freshness::from_config(config);
    match config.backend {
        CacheBackend::Memory => {
            tracing::warn!(
                capacity = config.capacity,
                "using in-memory cache; entries are not shared between instances"
            );
            Ok(Arc::new(MemoryStore::new(freshness, config.capacity, clock)))
        }
        CacheBackend::Redis => {
            let redis = config.redis.as_ref().ok_or_else(|| {
                Error::Configuration("cache.type is redis but cache.redis is missing".into())
            })?;
            let store = RedisStore::connect(redis, freshness, clock).await?;
            Ok(Arc::new(store))
        }
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------
