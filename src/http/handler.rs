//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET /:service/:owner/:repo?ref=&path=` - `package.json` for a repo
//! - `GET /healthz`                          - Health check
//! - `GET /metrics`                          - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, instrument, warn};

use crate::error::Error;
use crate::forge::Provider;
use crate::key::ManifestQuery;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/{service}/{owner}/{repo}", get(handle_manifest))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /:service/:owner/:repo?ref=&path=`
///
/// Resolves the manifest through the provider's [`crate::projbase::ProjectBase`]
/// and returns it verbatim as JSON.
#[instrument(skip(state, query), fields(%service, %owner, %repo))]
async fn handle_manifest(
    State(state): State<Arc<AppState>>,
    Path((service, owner, repo)): Path<(String, String, String)>,
    Query(query): Query<ManifestQuery>,
) -> Result<Response, AppError> {
    let project = Provider::from_service(&service)
        .and_then(|provider| state.projects.get(&provider))
        .ok_or_else(|| AppError::UnknownService(service.clone()))?;

    let pkg = project.get(&owner, &repo, &query).await?;
    Ok(Json(pkg).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        store: Arc::clone(&state.store),
        sources: state
            .projects
            .values()
            .map(|project| Arc::clone(project.source()))
            .collect(),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The `:service` segment names no configured provider.
    UnknownService(String),
    /// The manifest lookup failed.
    Manifest(Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::UnknownService(_) => StatusCode::NOT_FOUND,
            AppError::Manifest(err) => manifest_status(err),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn manifest_status(err: &Error) -> StatusCode {
    match err {
        Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::CacheBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::RemoteFetch { .. } if err.upstream_status() == Some(404) => StatusCode::NOT_FOUND,
        Error::RemoteFetch { .. }
        | Error::Decode { .. }
        | Error::Parse { .. }
        | Error::EmptyContent { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::UnknownService(service) => format!("service not supported: {service}"),
            AppError::Manifest(err) => err.to_string(),
            AppError::Internal(err) => format!("{err:#}"),
        };
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        } else {
            warn!(%status, error = %message, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Manifest(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
