//! Upstream API rate-limit tracking and throttle classification.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` (or the standardised
//! `RateLimit-Remaining` / `RateLimit-Reset`) from forge API responses, and
//! decides whether a failed response means "quota exhausted" (retry after the
//! advertised delay) or "abuse detected" (log only, never retry).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Extra attempts allowed after the first one when the quota is exhausted.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 2;

/// Delay used when a throttled response names no delay at all.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Shared rate-limit state updated after every forge API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls before the rate limit resets.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the rate limit window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current remaining calls; `None` until a response has reported it.
    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            u64::MAX => None,
            r => Some(r),
        }
    }

    /// Unix timestamp when the window resets.
    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Update state from HTTP response headers.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        if let Some(r) = remaining_header(headers) {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset_header(headers) {
            self.reset_at.store(r, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Throttle classification
// ---------------------------------------------------------------------------

/// Why the forge refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Primary quota exhausted.  Safe to retry after `retry_after`.
    QuotaExhausted { retry_after: Duration },
    /// Secondary / abuse-detection limit.  Never retried.
    Abuse,
}

/// Classify a failed response.  Returns `None` for ordinary failures.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> Option<Throttle> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let lowered = body.to_ascii_lowercase();
    if lowered.contains("secondary rate limit") || lowered.contains("abuse") {
        return Some(Throttle::Abuse);
    }

    let exhausted = remaining_header(headers) == Some(0);
    let retry_after = retry_after_header(headers);
    if exhausted || retry_after.is_some() || status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after
            .or_else(|| reset_header(headers).map(secs_until))
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Some(Throttle::QuotaExhausted { retry_after });
    }

    None
}

fn header_u64(headers: &HeaderMap, names: &[&str]) -> Option<u64> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn remaining_header(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, &["X-RateLimit-Remaining", "RateLimit-Remaining"])
}

fn reset_header(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, &["X-RateLimit-Reset", "RateLimit-Reset"])
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, &["Retry-After"]).map(Duration::from_secs)
}

fn secs_until(reset_at: u64) -> Duration {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    Duration::from_secs(reset_at.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn default_remaining_is_unknown() {
        let state = RateLimitState::new();
        assert_eq!(state.remaining(), None);
    }

    #[test]
    fn update_from_github_headers() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[
            ("X-RateLimit-Remaining", "42"),
            ("X-RateLimit-Reset", "1700000000"),
        ]));
        assert_eq!(state.remaining(), Some(42));
        assert_eq!(state.reset_at(), 1700000000);
    }

    #[test]
    fn update_from_ietf_headers() {
        let state = RateLimitState::new();
        state.update_from_headers(&headers(&[
            ("RateLimit-Remaining", "10"),
            ("RateLimit-Reset", "1800000000"),
        ]));
        assert_eq!(state.remaining(), Some(10));
        assert_eq!(state.reset_at(), 1800000000);
    }

    #[test]
    fn exhausted_quota_uses_retry_after() {
        let h = headers(&[("X-RateLimit-Remaining", "0"), ("Retry-After", "7")]);
        assert_eq!(
            classify(StatusCode::FORBIDDEN, &h, r#"{"message":"API rate limit exceeded"}"#),
            Some(Throttle::QuotaExhausted {
                retry_after: Duration::from_secs(7)
            })
        );
    }

    #[test]
    fn exhausted_quota_falls_back_to_reset() {
        let reset = chrono::Utc::now().timestamp() as u64 + 30;
        let h = headers(&[("X-RateLimit-Remaining", "0")]);
        let mut h = h;
        h.insert("X-RateLimit-Reset", reset.to_string().parse().unwrap());
        match classify(StatusCode::FORBIDDEN, &h, "") {
            Some(Throttle::QuotaExhausted { retry_after }) => {
                assert!((29..=31).contains(&retry_after.as_secs()));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn secondary_limit_is_abuse() {
        let h = headers(&[("Retry-After", "60")]);
        let body = r#"{"message":"You have exceeded a secondary rate limit."}"#;
        assert_eq!(classify(StatusCode::FORBIDDEN, &h, body), Some(Throttle::Abuse));
    }

    #[test]
    fn plain_forbidden_is_not_throttled() {
        let h = headers(&[("X-RateLimit-Remaining", "4999")]);
        assert_eq!(
            classify(StatusCode::FORBIDDEN, &h, r#"{"message":"Resource not accessible"}"#),
            None
        );
    }

    #[test]
    fn other_statuses_are_not_throttled() {
        let h = headers(&[("X-RateLimit-Remaining", "0")]);
        assert_eq!(classify(StatusCode::NOT_FOUND, &h, ""), None);
        assert_eq!(classify(StatusCode::BAD_GATEWAY, &h, ""), None);
    }

    #[test]
    fn too_many_requests_without_headers_uses_default_delay() {
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), ""),
            Some(Throttle::QuotaExhausted {
                retry_after: DEFAULT_RETRY_AFTER
            })
        );
    }
}
