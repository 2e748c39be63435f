use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::{errors::AppError, models::SubmitOutcome};

const HTTP_REQUESTS: &str = "game_ratings_http_requests_total";
const HTTP_DURATION: &str = "game_ratings_http_request_duration_seconds";
const SUBMISSIONS: &str = "game_ratings_submissions_total";
const INGEST_MESSAGES: &str = "game_ratings_ingest_messages_total";

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// How the consumer finished with one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    Acked,
    Retried,
    Dropped,
}

impl IngestResult {
    fn as_str(self) -> &'static str {
        match self {
            IngestResult::Acked => "acked",
            IngestResult::Retried => "retried",
            IngestResult::Dropped => "dropped",
        }
    }
}

/// Installs the process-wide Prometheus recorder. Safe to call more than once.
pub fn init() -> Result<(), AppError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(HTTP_DURATION.into()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| AppError::InternalError(format!("Failed to configure metrics: {e}")))?
            .install_recorder()
            .map_err(|e| AppError::InternalError(format!("Failed to install metrics: {e}")))?;

        describe_counter!(HTTP_REQUESTS, "HTTP requests served by the rating service.");
        describe_histogram!(HTTP_DURATION, "HTTP request latency.");
        describe_counter!(SUBMISSIONS, "Committed rating submissions by outcome.");
        describe_counter!(
            INGEST_MESSAGES,
            "Rating stream entries by what the consumer did with them."
        );

        Ok::<_, AppError>(handle)
    })?;

    Ok(())
}

pub async fn metrics_handler() -> Response {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialised",
        )
            .into_response();
    };

    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    )];
    (StatusCode::OK, headers, handle.render()).into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_owned();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        HTTP_REQUESTS,
        1,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status.clone()
    );
    histogram!(
        HTTP_DURATION,
        latency,
        "method" => method,
        "path" => path,
        "status" => status
    );

    response
}

pub fn record_submission(outcome: SubmitOutcome) {
    counter!(SUBMISSIONS, 1, "outcome" => outcome.as_str());
}

pub fn record_ingest(result: IngestResult) {
    counter!(INGEST_MESSAGES, 1, "result" => result.as_str());
}
