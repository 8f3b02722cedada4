//! Forge backend abstraction layer.
//!
//! Provides the [`ManifestSource`] trait that encapsulates all forge-specific
//! API interaction needed to read a repository's `package.json`.  The
//! orchestrator only sees [`FetchOutcome`]s and typed errors; no
//! forge-specific URL construction or response parsing leaks outside this
//! module.  GitHub is the only backend today; [`Provider`] is the seam for
//! adding others.

pub mod github;
pub mod rate_limit;

use std::fmt;

use crate::error::Result;
use crate::key::ManifestQuery;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Source-hosting service a manifest is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GitHub,
}

impl Provider {
    /// Short name used as the first cache-key component and route segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "gh",
        }
    }

    /// Resolve the `:service` route segment.
    pub fn from_service(service: &str) -> Option<Self> {
        match service {
            "gh" | "github" => Some(Self::GitHub),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fetch outcome
// ---------------------------------------------------------------------------

/// Successful result of a conditional manifest fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The forge confirmed the revalidation token still matches.
    Unchanged,
    /// New content, with the token to revalidate it next time.
    Updated {
        pkg: serde_json::Value,
        etag: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Retrieves and decodes a repository manifest from a forge.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetch `package.json` for `owner/repo` at `query`.
    ///
    /// When `etag` is given the request is conditional and may resolve to
    /// [`FetchOutcome::Unchanged`].  `key` is the cache key of the lookup and
    /// is used to qualify errors.
    async fn fetch_manifest(
        &self,
        owner: &str,
        repo: &str,
        query: &ManifestQuery,
        key: &str,
        etag: Option<&str>,
    ) -> Result<FetchOutcome>;

    /// Quick reachability probe of the forge API for health checks.
    async fn probe(&self) -> Result<()>;
}
