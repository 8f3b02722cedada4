use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::CacheStore;
use crate::forge::ManifestSource;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Minimal subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn CacheStore>,
    pub sources: Vec<Arc<dyn ManifestSource>>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_cache(store: &dyn CacheStore) -> CheckResult {
    let backend = store.backend().as_str();
    match store.ping().await {
        Ok(()) => CheckResult::healthy(backend),
        Err(e) => CheckResult::unhealthy(format!("{backend}: {e}")),
    }
}

async fn check_upstream(sources: &[Arc<dyn ManifestSource>]) -> CheckResult {
    let probes = sources.iter().map(|source| async move {
        let provider = source.provider();
        source
            .probe()
            .await
            .map(|()| provider.to_string())
            .map_err(|e| format!("{provider}: {e}"))
    });
    let results = futures::future::join_all(probes).await;

    let failures: Vec<String> = results.iter().filter_map(|r| r.clone().err()).collect();
    if failures.is_empty() {
        let names: Vec<String> = results.into_iter().filter_map(Result::ok).collect();
        CheckResult::healthy(names.join(", "))
    } else {
        CheckResult::unhealthy(failures.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.cache.ok && checks.upstream.ok {
        HealthStatus::Ok
    } else if !checks.cache.ok {
        // Every lookup goes through the cache.
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (cache, upstream) = tokio::join!(
        check_cache(state.store.as_ref()),
        check_upstream(&state.sources),
    );

    let checks = HealthChecks { cache, upstream };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(ok: bool) -> CheckResult {
        CheckResult { ok, detail: None }
    }

    #[test]
    fn all_ok_is_ok() {
        let checks = HealthChecks {
            cache: check(true),
            upstream: check(true),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Ok);
    }

    #[test]
    fn upstream_down_is_degraded() {
        let checks = HealthChecks {
            cache: check(true),
            upstream: check(false),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[test]
    fn cache_down_is_unhealthy() {
        let checks = HealthChecks {
            cache: check(false),
            upstream: check(true),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[test]
    fn serializes_lowercase_status() {
        let body = HealthResponse {
            status: HealthStatus::Degraded,
            checks: HealthChecks {
                cache: CheckResult::healthy("memory"),
                upstream: CheckResult::unhealthy("gh: timeout"),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["cache"]["detail"], "memory");
        assert_eq!(json["checks"]["upstream"]["ok"], false);
    }
}
