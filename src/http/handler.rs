//! Main axum router and HTTP request handlers for the redirect service.
//!
//! Routes:
//! - `GET    /v1/redirect/{service}/{region}/{url}[/{err}]` - redirect to a regional copy
//! - `DELETE /v1/purge/{service}/{region}/{url}[/{err}]`    - purge a cached copy
//! - `GET    /v1/ping`                                      - liveness
//! - `GET    /v1/api-reference`                             - route listing
//! - `GET    /healthz`                                      - health check
//! - `GET    /metrics`                                      - Prometheus metrics
//!
//! The `{url}` segment is the percent-encoded origin URL.  When a client
//! forgets to encode it, the URL's own slashes spill into extra path
//! segments which the `{*err}` routes capture; such requests are malformed.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheManager, RedirectStatus};
use crate::validate;
use crate::AppState;

/// Route tokens: 1-22 chars of `[A-Za-z0-9_-]`.
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 22
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/redirect/{service}/{region}/{url}", get(handle_redirect))
        .route(
            "/v1/redirect/{service}/{region}/{url}/{*err}",
            get(handle_redirect_spill),
        )
        .route("/v1/purge/{service}/{region}/{url}", delete(handle_purge))
        .route(
            "/v1/purge/{service}/{region}/{url}/{*err}",
            delete(handle_purge_spill),
        )
        .route("/v1/ping", get(handle_ping))
        .route("/v1/api-reference", get(handle_api_reference))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Shared parameter handling
// ---------------------------------------------------------------------------

/// Validate path tokens and select the pool.  Zero matching pools is 404;
/// duplicate registration cannot occur (the fleet refuses to start).
fn select_pool(
    state: &AppState,
    service: &str,
    region: &str,
) -> Result<Arc<CacheManager>, AppError> {
    if !is_valid_token(service) || !is_valid_token(region) {
        return Err(AppError::Input("invalid service or region token".into()));
    }
    let pool_id = crate::cache::manager::pool_id(service, region);
    state
        .fleet
        .pools
        .get(&pool_id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("no cache pool for {service}/{region}")))
}

fn malformed_url_error() -> AppError {
    AppError::Input("the url path segment must be percent-encoded".into())
}

// ---------------------------------------------------------------------------
// Redirect
// ---------------------------------------------------------------------------

async fn handle_redirect(
    State(state): State<Arc<AppState>>,
    Path((service, region, url)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    redirect_inner(&state, &service, &region, &url).await
}

/// An unencoded URL spills its path into extra segments; reject it.
async fn handle_redirect_spill(
    State(_state): State<Arc<AppState>>,
    Path((_service, _region, _url, _err)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    Err(malformed_url_error())
}

/// Poll the pool at 1 Hz until the copy is `present` or the wait budget is
/// spent, requesting a copy when none is in flight.
#[instrument(skip(state), fields(%service, %region))]
async fn redirect_inner(
    state: &AppState,
    service: &str,
    region: &str,
    url: &str,
) -> Result<Response, AppError> {
    let manager = select_pool(state, service, region)?;

    // Policy gate before anything else: a disallowed or insecure URL is
    // rejected without a status read, an enqueue, or a poll delay.
    validate::precheck_url(url, &manager.allowlist, manager.ensure_ssl)
        .map_err(AppError::from_validation)?;

    let started = Instant::now();
    let deadline = started + Duration::from_millis(state.config.cache.max_wait_ms);
    let mut validated = false;

    while Instant::now() < deadline {
        let lookup = manager
            .get_url_for_redirect(url)
            .await
            .map_err(AppError::Internal)?;

        match lookup.status {
            RedirectStatus::Present => {
                state
                    .metrics
                    .metrics
                    .redirect_wait_seconds
                    .get_or_create(&manager.labels())
                    .observe(started.elapsed().as_secs_f64());
                debug!(%url, location = %lookup.url, "redirecting to regional copy");
                return Ok(found_response(&lookup.url, "present"));
            }
            RedirectStatus::Pending => {}
            RedirectStatus::Absent => {
                if !validated {
                    // The full chain walk runs once per request; policy
                    // failures are 403, origin failures a generic 400.
                    validate::validate_url(
                        &state.validator_client,
                        url,
                        &manager.allowlist,
                        state.config.redirect.limit,
                        manager.ensure_ssl,
                    )
                    .await
                    .map_err(AppError::from_validation)?;
                    validated = true;
                }
                manager.request_put(url).await.map_err(AppError::Internal)?;
            }
            RedirectStatus::Error => {
                manager.request_put(url).await.map_err(AppError::Internal)?;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1).min(remaining)).await;
    }

    // Wait budget spent: send the client to the origin instead.
    state
        .metrics
        .metrics
        .redirect_original
        .get_or_create(&manager.labels())
        .inc();
    info!(%url, "copy not ready in time, redirecting to original URL");
    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, url.to_string())],
        Json(json!({
            "status": "absent",
            "url": url,
            "reason": "no cached copy became available within the wait budget",
        })),
    )
        .into_response())
}

fn found_response(location: &str, status: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
        Json(json!({ "status": status, "url": location })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

async fn handle_purge(
    State(state): State<Arc<AppState>>,
    Path((service, region, url)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let manager = select_pool(&state, &service, &region)?;
    manager.purge(&url).await.map_err(AppError::Internal)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_purge_spill(
    State(_state): State<Arc<AppState>>,
    Path((_service, _region, _url, _err)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    Err(malformed_url_error())
}

// ---------------------------------------------------------------------------
// Ping / api-reference
// ---------------------------------------------------------------------------

async fn handle_ping() -> impl IntoResponse {
    Json(json!({ "alive": true }))
}

async fn handle_api_reference() -> impl IntoResponse {
    Json(json!({
        "routes": [
            { "method": "GET",    "path": "/v1/redirect/{service}/{region}/{url}" },
            { "method": "DELETE", "path": "/v1/purge/{service}/{region}/{url}" },
            { "method": "GET",    "path": "/v1/ping" },
            { "method": "GET",    "path": "/v1/api-reference" },
            { "method": "GET",    "path": "/healthz" },
            { "method": "GET",    "path": "/metrics" },
        ],
        "notes": "the url segment must be a percent-encoded https URL",
    }))
}

// ---------------------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        status_store: state.status_pool.clone(),
        sqs: state.sqs.clone(),
        queue_urls: state.fleet.queue_urls.clone(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
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
/// Internal detail (stack text included) never reaches a client.
#[derive(Debug)]
pub enum AppError {
    /// Malformed path or an unencoded URL segment.
    Input(String),
    /// Allowlist or TLS policy rejection.
    Forbidden(String),
    /// Unknown (service, region).
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    /// Map a validation failure: policy rejections are 403, everything else
    /// is a generic 400 with no upstream diagnostic echoed.
    fn from_validation(err: validate::ValidationError) -> Self {
        if err.is_policy_rejection() {
            AppError::Forbidden(err.to_string())
        } else {
            warn!(error = %err, "URL validation failed");
            AppError::Input("the requested URL failed validation".into())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Input(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "reason": reason }))).into_response()
            }
            AppError::Forbidden(reason) => {
                (StatusCode::FORBIDDEN, Json(json!({ "reason": reason }))).into_response()
            }
            AppError::NotFound(reason) => {
                (StatusCode::NOT_FOUND, Json(json!({ "reason": reason }))).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "reason": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_accept_the_documented_alphabet() {
        assert!(is_valid_token("s3"));
        assert!(is_valid_token("us-west-1"));
        assert!(is_valid_token("a_B-9"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token("twenty-three-characters"));
        assert!(!is_valid_token("has.dot"));
        assert!(!is_valid_token("has/slash"));
    }

    #[test]
    fn validation_errors_map_to_the_documented_statuses() {
        let forbidden =
            AppError::from_validation(validate::ValidationError::DisallowedUrl("u".into()));
        assert!(matches!(forbidden, AppError::Forbidden(_)));

        let forbidden =
            AppError::from_validation(validate::ValidationError::InsecureUrl("u".into()));
        assert!(matches!(forbidden, AppError::Forbidden(_)));

        let bad = AppError::from_validation(validate::ValidationError::TooManyRedirects(10));
        // Origin-side failures surface as a generic input error.
        match bad {
            AppError::Input(reason) => assert!(!reason.contains("10")),
            other => panic!("expected Input, got {other:?}"),
        }
    }
}
