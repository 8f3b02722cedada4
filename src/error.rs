//! Typed errors for the manifest cache core.
//!
//! Every variant is `Clone` so that a single coalesced fetch can hand the
//! same outcome to every waiter.  Variants raised while resolving a manifest
//! carry the cache key so log lines and HTTP error bodies say which lookup
//! failed.

use std::sync::Arc;

/// Result alias used by the cache, coalescer, fetcher and orchestrator.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A required configuration field is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cache backend is unreachable or rejected an operation.
    ///
    /// `key` is the cache key for reads and writes, and the endpoint for
    /// connection-level operations.
    #[error("cache backend {op} failed for {key}: {message}")]
    CacheBackend {
        op: &'static str,
        key: String,
        message: String,
    },

    /// The remote source returned a failure other than "not modified".
    #[error("failed to get package.json for {key}: {message}")]
    RemoteFetch {
        key: String,
        status: Option<u16>,
        message: String,
    },

    /// The content could not be decoded with the declared encoding.
    #[error("failed to decode package.json for {key}: {message}")]
    Decode { key: String, message: String },

    /// The decoded content is not valid JSON.
    #[error("failed to parse package.json for {key}: {source}")]
    Parse {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The fetch succeeded but the manifest was empty.
    #[error("empty package.json for {key}")]
    EmptyContent { key: String },
}

impl Error {
    pub(crate) fn cache(op: &'static str, key: &str, err: impl std::fmt::Display) -> Self {
        Self::CacheBackend {
            op,
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn remote(key: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RemoteFetch {
            key: key.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Upstream HTTP status attached to a remote failure, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::RemoteFetch { status, .. } => *status,
            _ => None,
        }
    }
}
