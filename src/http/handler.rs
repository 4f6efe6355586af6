//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /devices`        - Registered devices and their firmware versions
//! - `GET  /versions`       - Firmware versions available for deployment
//! - `POST /update-device`  - Create a firmware-update job for one device
//! - `POST /bootstrap`      - Repository bootstrap lifecycle event
//! - `GET  /healthz`        - Health check
//! - `GET  /metrics`        - Prometheus metrics
//!
//! Every response carries the configured CORS headers; `OPTIONS` on the API
//! routes answers the browser preflight.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::AppState;
use crate::fleet::{self, UpdateRequest};

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type,Authorization";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/devices", get(handle_devices).options(handle_preflight))
        .route("/versions", get(handle_versions).options(handle_preflight))
        .route(
            "/update-device",
            post(handle_update_device).options(handle_preflight),
        )
        .route("/bootstrap", post(handle_bootstrap))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_headers,
        ))
        .with_state(state)
}

/// Append the CORS headers to every response.
async fn cors_headers(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        state.cors_allow_origin.clone(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpdateDeviceBody {
    device_name: String,
    #[serde(alias = "version")]
    new_version: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /devices`
#[instrument(skip(state))]
async fn handle_devices(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.metrics.record_request("devices");
    let devices = fleet::list_devices(state.fleet.as_ref()).await?;
    info!(count = devices.len(), "listed devices");
    Ok((StatusCode::OK, Json(devices)).into_response())
}

/// `GET /versions`
async fn handle_versions(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.record_request("versions");
    (StatusCode::OK, Json(&state.config.fleet.firmware_versions)).into_response()
}

/// `POST /update-device`
///
/// The body is decoded exactly once; a JSON string wrapping another JSON
/// document is rejected like any other malformed body.
#[instrument(skip(state, body))]
async fn handle_update_device(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.metrics.record_request("update-device");

    let request: UpdateDeviceBody = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "rejected update-device body");
        ApiError::BadRequest {
            message: "Invalid JSON format".into(),
            error: e.to_string(),
        }
    })?;

    let device_name = request.device_name.trim();
    let version = request.new_version.trim();
    if device_name.is_empty() || version.is_empty() {
        return Err(ApiError::BadRequest {
            message: "Invalid request".into(),
            error: "device_name and new_version must not be empty".into(),
        });
    }

    let created = fleet::dispatch_update(
        state.fleet.as_ref(),
        &state.config.aws.region,
        &state.config.fleet,
        UpdateRequest {
            thing_name: device_name.to_string(),
            version: version.to_string(),
            ..UpdateRequest::default()
        },
    )
    .await?;

    info!(job_id = %created.job_id, %device_name, %version, "firmware update triggered");
    Ok((
        StatusCode::OK,
        Json(json!({
            "message": "Job created successfully",
            "job_id": created.job_id,
            "job_arn": created.job_arn,
        })),
    )
        .into_response())
}

/// `OPTIONS` preflight; the CORS layer adds the headers.
async fn handle_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `POST /bootstrap`
///
/// Runs one bootstrap invocation.  The outcome is reported to the event's
/// callback and also returned in the response body.  A malformed event that
/// still names a callback is reported there as failed; only an event with
/// no usable callback is answered with 400.
#[instrument(skip(state, body))]
async fn handle_bootstrap(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.metrics.record_request("bootstrap");
    let invalid = |e: serde_json::Error| ApiError::BadRequest {
        message: "Invalid lifecycle event".into(),
        error: e.to_string(),
    };

    let value: serde_json::Value = serde_json::from_slice(&body).map_err(invalid)?;
    let outcome = state
        .bootstrapper
        .handle_value(value)
        .await
        .map_err(invalid)?;
    Ok((StatusCode::OK, Json(outcome)).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(State(Arc::clone(&state.config))).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let buf = state.metrics.encode()?;
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

/// Application-level error type that maps to JSON error responses.
#[derive(Debug)]
pub enum ApiError {
    /// The request body could not be used.
    BadRequest { message: String, error: String },
    /// An upstream call or other unexpected failure.
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest { message, error } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": message, "error": error })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "message": "Internal Server Error",
                        "error": format!("{err:#}"),
                    })),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

/// Header names set by the CORS layer.
#[cfg(test)]
pub(crate) const CORS_HEADERS: [axum::http::HeaderName; 3] = [
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
    header::ACCESS_CONTROL_ALLOW_METHODS,
    header::ACCESS_CONTROL_ALLOW_HEADERS,
];

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use anyhow::{Result, bail};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;
    use crate::bootstrap::Bootstrapper;
    use crate::bootstrap::archive::HttpArchiveSource;
    use crate::bootstrap::report::CallbackReporter;
    use crate::bootstrap::report::tests::{local_client, spawn_callback};
    use crate::config::Config;
    use crate::fleet::tests::FakeFleet;
    use crate::metrics::MetricsRegistry;
    use crate::repository::{CommitOutcome, CommitRequest, RepositoryStore};

    struct UnusedStore;

    #[async_trait::async_trait]
    impl RepositoryStore for UnusedStore {
        async fn repository_exists(&self, _name: &str) -> Result<bool> {
            bail!("unexpected repository lookup")
        }
        async fn create_repository(&self, _name: &str, _description: &str) -> Result<()> {
            bail!("unexpected repository creation")
        }
        async fn branch_head(&self, _name: &str, _branch: &str) -> Result<Option<String>> {
            bail!("unexpected branch lookup")
        }
        async fn commit(&self, _request: CommitRequest<'_>) -> Result<CommitOutcome> {
            bail!("unexpected commit")
        }
    }

    fn state_with(fleet: Arc<FakeFleet>, config: Config) -> Arc<AppState> {
        let metrics = MetricsRegistry::new();
        let http = local_client();
        let bootstrapper = Bootstrapper::new(
            config.bootstrap.clone(),
            Arc::new(HttpArchiveSource::new(http.clone())),
            Arc::new(UnusedStore),
            Arc::new(CallbackReporter::new(http)),
            metrics.clone(),
        );
        Arc::new(AppState {
            cors_allow_origin: HeaderValue::from_str(&config.server.cors_allow_origin).unwrap(),
            config: Arc::new(config),
            fleet,
            bootstrapper: Arc::new(bootstrapper),
            metrics,
        })
    }

    async fn send(state: Arc<AppState>, request: HttpRequest<Body>) -> (StatusCode, Response) {
        let response = create_router(state).oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn devices_lists_versions_with_cors() {
        let fleet = Arc::new(FakeFleet::with_things(&[
            ("robot-1", Some("2"), 1),
            ("robot-2", None, 1),
        ]));
        let (status, response) = send(state_with(fleet, Config::default()), get("/devices")).await;

        assert_eq!(status, StatusCode::OK);
        for name in CORS_HEADERS {
            assert!(response.headers().contains_key(&name), "missing {name}");
        }
        assert_eq!(
            json_body(response).await,
            json!([
                { "device_name": "robot-1", "current_version": "2" },
                { "device_name": "robot-2", "current_version": "Unknown" },
            ])
        );
    }

    #[tokio::test]
    async fn versions_returns_configured_list() {
        let (status, response) = send(
            state_with(Arc::new(FakeFleet::default()), Config::default()),
            get("/versions"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!(["1", "2", "3"]));
    }

    #[tokio::test]
    async fn update_device_creates_job() {
        let fleet = Arc::new(FakeFleet::default());
        let (status, response) = send(
            state_with(fleet.clone(), Config::default()),
            post(
                "/update-device",
                r#"{"device_name":"robot-1","new_version":"3"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Job created successfully");
        let jobs = fleet.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(body["job_id"], jobs[0].job_id.as_str());
        assert_eq!(
            jobs[0].targets,
            vec!["arn:aws:iot:us-east-1:123456789012:thing/robot-1"]
        );
    }

    #[tokio::test]
    async fn update_device_accepts_version_alias() {
        let fleet = Arc::new(FakeFleet::default());
        let (status, _) = send(
            state_with(fleet.clone(), Config::default()),
            post("/update-device", r#"{"device_name":"robot-1","version":"2"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fleet.jobs().len(), 1);
    }

    #[tokio::test]
    async fn update_device_rejects_double_encoded_body() {
        let fleet = Arc::new(FakeFleet::default());
        let double = serde_json::to_string(r#"{"device_name":"robot-1","new_version":"3"}"#).unwrap();
        let (status, response) = send(
            state_with(fleet.clone(), Config::default()),
            post("/update-device", &double),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "Invalid JSON format");
        assert!(fleet.jobs().is_empty());
    }

    #[tokio::test]
    async fn update_device_rejects_empty_fields() {
        let (status, _) = send(
            state_with(Arc::new(FakeFleet::default()), Config::default()),
            post("/update-device", r#"{"device_name":" ","new_version":"3"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn job_failure_is_internal_error_with_cors() {
        let fleet = Arc::new(FakeFleet {
            fail_jobs: true,
            ..FakeFleet::default()
        });
        let (status, response) = send(
            state_with(fleet, Config::default()),
            post(
                "/update-device",
                r#"{"device_name":"robot-1","new_version":"3"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
        let body = json_body(response).await;
        assert_eq!(body["message"], "Internal Server Error");
        assert!(body["error"].as_str().unwrap().contains("LimitExceeded"));
    }

    #[tokio::test]
    async fn preflight_uses_configured_origin() {
        let mut config = Config::default();
        config.server.cors_allow_origin = "http://localhost:3000".into();
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/update-device")
            .body(Body::empty())
            .unwrap();
        let (status, response) =
            send(state_with(Arc::new(FakeFleet::default()), config), request).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            ALLOW_METHODS
        );
    }

    #[tokio::test]
    async fn bootstrap_delete_reports_success() {
        let (status, response) = send(
            state_with(Arc::new(FakeFleet::default()), Config::default()),
            post(
                "/bootstrap",
                r#"{"RequestType":"Delete","RequestId":"r","StackId":"s","LogicalResourceId":"l"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "SUCCESS" }));
    }

    #[tokio::test]
    async fn bootstrap_reports_malformed_event_to_callback() {
        let (url, received) = spawn_callback(StatusCode::OK).await;
        let body = json!({
            "RequestType": "Create",
            "ResponseURL": url,
            "StackId": "stack-1",
            "RequestId": "req-5",
            "LogicalResourceId": "PopulateRepo",
            "ResourceProperties": { "RepositoryName": 42 }
        });
        let (status, response) = send(
            state_with(Arc::new(FakeFleet::default()), Config::default()),
            post("/bootstrap", &body.to_string()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "FAILED");

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body["Status"], "FAILED");
        assert_eq!(received[0].body["RequestId"], "req-5");
        assert_eq!(received[0].body["PhysicalResourceId"], "PopulateRepo");
    }

    #[tokio::test]
    async fn bootstrap_rejects_malformed_event() {
        let (status, _) = send(
            state_with(Arc::new(FakeFleet::default()), Config::default()),
            post("/bootstrap", r#"{"RequestType":"Explode"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_count_requests() {
        let state = state_with(Arc::new(FakeFleet::default()), Config::default());
        send(Arc::clone(&state), get("/versions")).await;
        let (status, response) = send(state, get("/metrics")).await;

        assert_eq!(status, StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("firmware_ota_http_requests_total{endpoint=\"versions\"} 1"));
    }
}
