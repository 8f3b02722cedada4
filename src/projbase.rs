//! Manifest lookup orchestration.
//!
//! [`ProjectBase::get`] is the read-through path: fresh cache hits return
//! immediately; misses and stale entries go through the [`Coalescer`] so
//! each key is fetched at most once at a time, and the fetched (or
//! revalidated) manifest is written back before any waiter sees it.
//!
//! Hard fetch failures are returned to the caller even when a stale entry
//! exists.  Only a "not modified" answer reuses cached data.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::cache::{CacheStore, CachedManifest};
use crate::coalesce::Coalescer;
use crate::error::{Error, Result};
use crate::forge::{FetchOutcome, ManifestSource, Provider};
use crate::key::{cache_key, ManifestQuery};
use crate::metrics::{FetchResult, LookupOutcome, MetricsRegistry};

pub type Manifest = serde_json::Value;

/// Cached, coalesced manifest lookups for one provider.
pub struct ProjectBase {
    store: Arc<dyn CacheStore>,
    source: Arc<dyn ManifestSource>,
    coalescer: Coalescer<Manifest>,
    metrics: MetricsRegistry,
}

impl ProjectBase {
    pub fn new(
        store: Arc<dyn CacheStore>,
        source: Arc<dyn ManifestSource>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            source,
            coalescer: Coalescer::new(),
            metrics,
        }
    }

    pub fn provider(&self) -> Provider {
        self.source.provider()
    }

    pub fn source(&self) -> &Arc<dyn ManifestSource> {
        &self.source
    }

    /// Return the `package.json` of `owner/repo` at `query`.
    #[instrument(skip(self, query), fields(provider = %self.provider()))]
    pub async fn get(&self, owner: &str, repo: &str, query: &ManifestQuery) -> Result<Manifest> {
        let key = cache_key(self.provider().as_str(), owner, repo, query);
        let lookup = self.store.get(&key).await?;

        match (&lookup.value, lookup.stale) {
            (Some(cached), false) => {
                debug!(%key, version = ?cached.pkg.get("version"), "cache hit");
                self.metrics.metrics.record_lookup(LookupOutcome::Hit);
                return Ok(cached.pkg.clone());
            }
            (Some(_), true) => self.metrics.metrics.record_lookup(LookupOutcome::Stale),
            (None, _) => self.metrics.metrics.record_lookup(LookupOutcome::Miss),
        }

        if self.coalescer.is_pending(&key) {
            self.metrics.metrics.coalesced_waiters.inc();
        }

        let refresh = Refresh {
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            metrics: self.metrics.clone(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            query: query.clone(),
            key: key.clone(),
            previous: lookup.value,
        };
        self.coalescer.run(&key, move || refresh.run()).await
    }
}

/// One revalidation of a key, owned so it can outlive the caller that
/// started it.
struct Refresh {
    store: Arc<dyn CacheStore>,
    source: Arc<dyn ManifestSource>,
    metrics: MetricsRegistry,
    owner: String,
    repo: String,
    query: ManifestQuery,
    key: String,
    previous: Option<CachedManifest>,
}

impl Refresh {
    async fn run(self) -> Result<Manifest> {
        let etag = self.previous.as_ref().and_then(|p| p.etag.as_deref());
        let outcome = self
            .source
            .fetch_manifest(&self.owner, &self.repo, &self.query, &self.key, etag)
            .await;

        match outcome {
            Ok(FetchOutcome::Unchanged) => {
                self.metrics.metrics.record_fetch(FetchResult::NotModified);
                let Some(previous) = self.previous else {
                    return Err(Error::remote(
                        &self.key,
                        Some(304),
                        "not modified returned for an unconditional request",
                    ));
                };
                info!(key = %self.key, "stale but unmodified package.json");
                let pkg = previous.pkg.clone();
                self.store.set(&self.key, previous).await?;
                Ok(pkg)
            }
            Ok(FetchOutcome::Updated { pkg, etag }) => {
                self.metrics.metrics.record_fetch(FetchResult::Updated);
                info!(
                    key = %self.key,
                    name = ?pkg.get("name"),
                    version = ?pkg.get("version"),
                    "got package.json"
                );
                self.store
                    .set(
                        &self.key,
                        CachedManifest {
                            pkg: pkg.clone(),
                            etag,
                        },
                    )
                    .await?;
                Ok(pkg)
            }
            Err(err) => {
                self.metrics.metrics.record_fetch(FetchResult::Error);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::testing::ManualClock;
    use crate::cache::{Freshness, Lookup, MemoryStore};
    use crate::config::CacheBackend;

    const T0: i64 = 1_700_000_000_000;
    const MAX_AGE: i64 = 60_000;
    const MAX_STALE: i64 = 30_000;

    /// Scripted forge: replays queued outcomes and records every call.
    #[derive(Default)]
    struct ScriptedSource {
        outcomes: Mutex<VecDeque<Result<FetchOutcome>>>,
        etags_seen: Mutex<Vec<Option<String>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn with(outcomes: Vec<Result<FetchOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ManifestSource for ScriptedSource {
        fn provider(&self) -> Provider {
            Provider::GitHub
        }

        async fn fetch_manifest(
            &self,
            _owner: &str,
            _repo: &str,
            _query: &ManifestQuery,
            key: &str,
            etag: Option<&str>,
        ) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.etags_seen.lock().unwrap().push(etag.map(str::to_string));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::remote(key, Some(500), "no scripted outcome")))
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Store whose every operation fails.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, key: &str) -> Result<Lookup> {
            Err(Error::cache("GET", key, "connection refused"))
        }

        async fn set(&self, key: &str, _value: CachedManifest) -> Result<()> {
            Err(Error::cache("SET", key, "connection refused"))
        }

        async fn ping(&self) -> Result<()> {
            Err(Error::cache("PING", "redis://cache.invalid", "connection refused"))
        }

        fn backend(&self) -> CacheBackend {
            CacheBackend::Redis
        }
    }

    fn widgets(version: &str) -> Manifest {
        json!({"name": "widgets", "version": version})
    }

    fn updated(version: &str, etag: &str) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Updated {
            pkg: widgets(version),
            etag: Some(etag.to_string()),
        })
    }

    fn setup(source: ScriptedSource) -> (ProjectBase, Arc<ScriptedSource>, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::at(T0));
        let store = Arc::new(MemoryStore::new(
            Freshness::new(MAX_AGE as u64, MAX_STALE as u64),
            1_000,
            clock.clone(),
        ));
        let source = Arc::new(source);
        let projbase = ProjectBase::new(store.clone(), source.clone(), MetricsRegistry::new());
        (projbase, source, clock, store)
    }

    #[tokio::test]
    async fn miss_fetches_then_serves_from_cache() {
        let (pb, source, clock, _) = setup(ScriptedSource::with(vec![updated("1.0.0", "\"v1\"")]));
        let query = ManifestQuery::default();

        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("1.0.0"));
        clock.advance(MAX_AGE - 1);
        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("1.0.0"));
        assert_eq!(source.calls(), 1);
        assert_eq!(*source.etags_seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn stale_entry_revalidates_with_etag() {
        let (pb, source, clock, _) = setup(ScriptedSource::with(vec![
            updated("1.0.0", "\"v1\""),
            updated("1.1.0", "\"v2\""),
        ]));
        let query = ManifestQuery::default();

        pb.get("acme", "widgets", &query).await.unwrap();
        clock.advance(MAX_AGE + 1);
        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("1.1.0"));
        assert_eq!(
            *source.etags_seen.lock().unwrap(),
            vec![None, Some("\"v1\"".to_string())]
        );
    }

    #[tokio::test]
    async fn not_modified_reuses_value_and_resets_freshness() {
        let (pb, source, clock, store) = setup(ScriptedSource::with(vec![
            updated("1.0.0", "\"v1\""),
            Ok(FetchOutcome::Unchanged),
        ]));
        let query = ManifestQuery::default();

        pb.get("acme", "widgets", &query).await.unwrap();
        clock.advance(MAX_AGE + 1);
        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("1.0.0"));
        assert_eq!(source.calls(), 2);

        // Fresh again for a full max_age from the revalidation.
        clock.advance(MAX_AGE - 1);
        let lookup = store.get("gh/acme/widgets").await.unwrap();
        assert!(lookup.is_fresh());
        assert_eq!(lookup.value.unwrap().etag.as_deref(), Some("\"v1\""));
        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("1.0.0"));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn hard_failure_does_not_fall_back_to_stale() {
        let (pb, _, clock, _) = setup(ScriptedSource::with(vec![
            updated("1.0.0", "\"v1\""),
            Err(Error::remote("gh/acme/widgets", Some(502), "Bad Gateway")),
        ]));
        let query = ManifestQuery::default();

        pb.get("acme", "widgets", &query).await.unwrap();
        clock.advance(MAX_AGE + 1);
        let err = pb.get("acme", "widgets", &query).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(502));
    }

    #[tokio::test]
    async fn expired_entry_is_refetched_unconditionally() {
        let (pb, source, clock, _) = setup(ScriptedSource::with(vec![
            updated("1.0.0", "\"v1\""),
            updated("2.0.0", "\"v2\""),
        ]));
        let query = ManifestQuery::default();

        pb.get("acme", "widgets", &query).await.unwrap();
        clock.advance(MAX_AGE + MAX_STALE + 1);
        assert_eq!(pb.get("acme", "widgets", &query).await.unwrap(), widgets("2.0.0"));
        assert_eq!(*source.etags_seen.lock().unwrap(), vec![None, None]);
    }

    #[tokio::test]
    async fn unexpected_not_modified_on_miss_is_an_error() {
        let (pb, _, _, _) = setup(ScriptedSource::with(vec![Ok(FetchOutcome::Unchanged)]));
        let err = pb
            .get("acme", "widgets", &ManifestQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err.upstream_status(), Some(304));
    }

    #[tokio::test]
    async fn refs_and_paths_are_cached_separately() {
        let (pb, source, _, _) = setup(ScriptedSource::with(vec![
            updated("1.0.0", "\"a\""),
            updated("2.0.0", "\"b\""),
        ]));
        let main = ManifestQuery::default().with_ref("main");
        let dev = ManifestQuery::default().with_ref("dev");

        assert_eq!(pb.get("acme", "widgets", &main).await.unwrap(), widgets("1.0.0"));
        assert_eq!(pb.get("acme", "widgets", &dev).await.unwrap(), widgets("2.0.0"));
        assert_eq!(pb.get("acme", "widgets", &main).await.unwrap(), widgets("1.0.0"));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        let (pb, source, _, _) = setup(
            ScriptedSource::with(vec![updated("1.0.0", "\"v1\"")])
                .delayed(Duration::from_millis(200)),
        );
        let pb = Arc::new(pb);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pb = Arc::clone(&pb);
            handles.push(tokio::spawn(async move {
                pb.get("acme", "widgets", &ManifestQuery::default()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), widgets("1.0.0"));
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_failure() {
        let (pb, source, _, _) = setup(
            ScriptedSource::with(vec![Err(Error::EmptyContent {
                key: "gh/acme/widgets".into(),
            })])
            .delayed(Duration::from_millis(200)),
        );
        let pb = Arc::new(pb);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let pb = Arc::clone(&pb);
            handles.push(tokio::spawn(async move {
                pb.get("acme", "widgets", &ManifestQuery::default()).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "empty package.json for gh/acme/widgets");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn cache_backend_errors_propagate() {
        let source = Arc::new(ScriptedSource::with(vec![updated("1.0.0", "\"v1\"")]));
        let pb = ProjectBase::new(Arc::new(BrokenStore), source.clone(), MetricsRegistry::new());
        let err = pb
            .get("acme", "widgets", &ManifestQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheBackend { op: "GET", .. }));
        assert_eq!(
            err.to_string(),
            "cache backend GET failed for gh/acme/widgets: connection refused"
        );
        assert_eq!(source.calls(), 0);
    }
}
