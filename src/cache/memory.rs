//! Bounded in-process cache backed by `mini-moka`.
//!
//! Capacity is an entry count.  moka's time-to-live is set to
//! `max_age + max_stale` so records age out without a sweeper; the read path
//! applies the same bound against the injected clock.

use std::sync::Arc;

use mini_moka::sync::Cache;
use tracing::trace;

use crate::config::CacheBackend;
use crate::error::Result;

use super::{CacheStore, CachedManifest, Clock, Freshness, Lookup, StoredEntry};

pub struct MemoryStore {
    entries: Cache<String, StoredEntry>,
    freshness: Freshness,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(freshness: Freshness, capacity: u64, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(freshness.ttl())
            .build();
        Self {
            entries,
            freshness,
            clock,
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let Some(entry) = self.entries.get(&key.to_string()) else {
            return Ok(Lookup::miss());
        };
        let now = self.clock.now_millis();
        if self.freshness.is_expired(entry.created_at, now) {
            self.entries.invalidate(&key.to_string());
            trace!(key, "memory cache entry expired");
            return Ok(Lookup::miss());
        }
        Ok(self.freshness.lookup(entry, now))
    }

    async fn set(&self, key: &str, value: CachedManifest) -> Result<()> {
        let entry = StoredEntry {
            value,
            created_at: self.clock.now_millis(),
        };
        self.entries.insert(key.to_string(), entry);
        trace!(key, "memory cache set");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> CacheBackend {
        CacheBackend::Memory
    }
}
