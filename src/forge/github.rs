//! GitHub / GitHub Enterprise backend implementation.
//!
//! Reads manifests through the repository contents API:
//! `GET {api_url}/repos/{owner}/{repo}/contents/{path}/package.json?ref=`.
//! Requests carry `If-None-Match` when a revalidation token is known, and a
//! `304` is reported as [`FetchOutcome::Unchanged`] without touching the
//! parse path.

use std::time::{Duration, Instant};

use base64::Engine as _;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::key::ManifestQuery;
use crate::metrics::MetricsRegistry;

use super::rate_limit::{self, RateLimitState, Throttle, MAX_RATE_LIMIT_RETRIES};
use super::{FetchOutcome, ManifestSource, Provider};

const ACCEPT_GITHUB_V3: &str = "application/vnd.github.v3+json";
const MANIFEST_FILE: &str = "package.json";

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct GitHubBackend {
    http_client: reqwest::Client,
    api_url: Url,
    token: Option<String>,
    max_retry_delay: Option<Duration>,
    rate_limit: RateLimitState,
    metrics: MetricsRegistry,
}

impl GitHubBackend {
    /// Build a backend for the API root in `config`.
    ///
    /// `http_client` should already carry the configured user agent and
    /// timeout.  The API token is read from `config.auth_token_env`.
    pub fn new(
        config: &UpstreamConfig,
        http_client: reqwest::Client,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        let api_url = Url::parse(config.api_url.trim_end_matches('/')).map_err(|e| {
            Error::Configuration(format!("invalid upstream.api_url {}: {e}", config.api_url))
        })?;
        if api_url.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "upstream.api_url {} cannot be used as a base URL",
                config.api_url
            )));
        }
        let token = config.auth_token();
        if token.is_none() {
            warn!(
                env = %config.auth_token_env,
                "no upstream API token configured; requests are unauthenticated"
            );
        }
        Ok(Self {
            http_client,
            api_url,
            token,
            max_retry_delay: config.max_retry_delay_secs.map(Duration::from_secs),
            rate_limit: RateLimitState::new(),
            metrics,
        })
    }

    #[cfg(test)]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    #[cfg(test)]
    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// Contents API URL for the manifest described by `query`.
    fn contents_url(&self, owner: &str, repo: &str, query: &ManifestQuery) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["repos", owner, repo, "contents"]);
            if let Some(path) = query.normalized_path() {
                segments.extend(path.split('/').filter(|s| !s.is_empty()));
            }
            segments.push(MANIFEST_FILE);
        }
        if let Some(git_ref) = query.git_ref() {
            url.query_pairs_mut().append_pair("ref", git_ref);
        }
        url
    }

    async fn send(&self, url: &Url, etag: Option<&str>) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .http_client
            .get(url.clone())
            .header(ACCEPT, ACCEPT_GITHUB_V3);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        request.send().await
    }

    /// Request `url` until it succeeds, fails for good, or the rate-limit
    /// attempt budget runs out.
    async fn fetch_with_retries(
        &self,
        url: &Url,
        key: &str,
        etag: Option<&str>,
    ) -> Result<FetchOutcome> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(key, %url, attempt, conditional = etag.is_some(), "requesting package.json");

            let resp = self
                .send(url, etag)
                .await
                .map_err(|e| Error::remote(key, None, format!("request failed: {e}")))?;
            self.observe_rate_limit(resp.headers());

            let status = resp.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::Unchanged);
            }
            if status.is_success() {
                let etag = resp
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| {
                        Error::remote(key, Some(status.as_u16()), format!("failed to read body: {e}"))
                    })?;
                let pkg = parse_contents(key, &body)?;
                return Ok(FetchOutcome::Updated { pkg, etag });
            }

            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            match rate_limit::classify(status, &headers, &body) {
                Some(Throttle::QuotaExhausted { retry_after }) => {
                    warn!(
                        key,
                        %url,
                        %status,
                        attempt,
                        reset_at = self.rate_limit.reset_at(),
                        "request quota exhausted"
                    );
                    if attempt > MAX_RATE_LIMIT_RETRIES {
                        return Err(Error::remote(
                            key,
                            Some(status.as_u16()),
                            format!("rate limit exceeded after {attempt} attempts"),
                        ));
                    }
                    let delay = self
                        .max_retry_delay
                        .map_or(retry_after, |cap| retry_after.min(cap));
                    info!(key, delay_secs = delay.as_secs(), "retrying after rate limit");
                    self.metrics.metrics.upstream_rate_limit_retries.inc();
                    tokio::time::sleep(delay).await;
                }
                Some(Throttle::Abuse) => {
                    warn!(key, %url, %status, "abuse detected for request");
                    self.metrics.metrics.upstream_abuse_detected.inc();
                    return Err(Error::remote(
                        key,
                        Some(status.as_u16()),
                        error_message(status, &body),
                    ));
                }
                None => {
                    return Err(Error::remote(
                        key,
                        Some(status.as_u16()),
                        error_message(status, &body),
                    ));
                }
            }
        }
    }

    fn observe_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        self.rate_limit.update_from_headers(headers);
        if let Some(remaining) = self.rate_limit.remaining() {
            self.metrics
                .metrics
                .upstream_api_rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
        }
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ManifestSource for GitHubBackend {
    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    async fn fetch_manifest(
        &self,
        owner: &str,
        repo: &str,
        query: &ManifestQuery,
        key: &str,
        etag: Option<&str>,
    ) -> Result<FetchOutcome> {
        let url = self.contents_url(owner, repo, query);
        let started = Instant::now();
        let result = self.fetch_with_retries(&url, key, etag).await;
        self.metrics
            .metrics
            .upstream_fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn probe(&self) -> Result<()> {
        let mut url = self.api_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("rate_limit");
        }
        let resp = self
            .http_client
            .get(url.clone())
            .header(ACCEPT, ACCEPT_GITHUB_V3)
            .send()
            .await
            .map_err(|e| Error::remote(url.as_str(), None, e.to_string()))?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(Error::remote(
                url.as_str(),
                Some(status.as_u16()),
                format!("probe returned {status}"),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Body of a contents API response for a single file.
#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// Decode and parse a contents API body into the manifest JSON.
fn parse_contents(key: &str, body: &[u8]) -> Result<serde_json::Value> {
    let contents: ContentsResponse = serde_json::from_slice(body).map_err(|e| Error::Decode {
        key: key.to_string(),
        message: format!("unexpected contents response: {e}"),
    })?;

    let raw = contents.content.unwrap_or_default();
    let text = decode_content(key, &raw, contents.encoding.as_deref())?;
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::EmptyContent {
            key: key.to_string(),
        });
    }

    let pkg: serde_json::Value = serde_json::from_str(text).map_err(|e| Error::Parse {
        key: key.to_string(),
        source: std::sync::Arc::new(e),
    })?;
    if pkg.is_null() {
        return Err(Error::EmptyContent {
            key: key.to_string(),
        });
    }
    Ok(pkg)
}

/// Decode `content` according to the encoding the API declared.
fn decode_content(key: &str, content: &str, encoding: Option<&str>) -> Result<String> {
    let bytes = match encoding.map(str::to_ascii_lowercase).as_deref() {
        Some("base64") => {
            // The API wraps base64 payloads at 60 columns.
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| Error::Decode {
                    key: key.to_string(),
                    message: format!("invalid base64 content: {e}"),
                })?
        }
        None | Some("") | Some("utf-8") | Some("utf8") | Some("none") => {
            content.as_bytes().to_vec()
        }
        Some(other) => {
            return Err(Error::Decode {
                key: key.to_string(),
                message: format!("unsupported content encoding {other:?}"),
            })
        }
    };
    String::from_utf8(bytes).map_err(|e| Error::Decode {
        key: key.to_string(),
        message: format!("content is not UTF-8: {e}"),
    })
}

/// Pull the API's `message` field out of an error body, if there is one.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string())
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
