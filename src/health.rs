use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::interfaces::ClientLike;
use serde::Serialize;

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
    pub status_store: CheckResult,
    pub queue: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
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
    pub status_store: fred::clients::Pool,
    pub sqs: aws_sdk_sqs::Client,
    pub queue_urls: Vec<String>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_status_store(pool: &fred::clients::Pool) -> CheckResult {
    match pool.ping::<String>(None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

async fn check_queue(sqs: &aws_sdk_sqs::Client, queue_urls: &[String]) -> CheckResult {
    let Some(url) = queue_urls.first() else {
        return CheckResult::unhealthy("no queues registered");
    };
    match sqs
        .get_queue_attributes()
        .queue_url(url)
        .attribute_names(aws_sdk_sqs::types::QueueAttributeName::QueueArn)
        .send()
        .await
    {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!(
            "GetQueueAttributes failed: {}",
            aws_sdk_sqs::error::DisplayErrorContext(&e)
        )),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.status_store.ok && checks.queue.ok;
    // The status store is required to serve any redirect at all; the queue
    // only gates new copies.
    let any_critical = !checks.status_store.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
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
    let (status_store, queue) = tokio::join!(
        check_status_store(&state.status_store),
        check_queue(&state.sqs, &state.queue_urls),
    );

    let checks = HealthChecks { status_store, queue };
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

    #[test]
    fn queue_failure_alone_is_degraded() {
        let checks = HealthChecks {
            status_store: CheckResult::healthy(),
            queue: CheckResult::unhealthy("boom"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[test]
    fn status_store_failure_is_unhealthy() {
        let checks = HealthChecks {
            status_store: CheckResult::unhealthy("down"),
            queue: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[test]
    fn all_ok_is_ok() {
        let checks = HealthChecks {
            status_store: CheckResult::healthy(),
            queue: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Ok);
    }
}
