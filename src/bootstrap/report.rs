//! Outcome delivery to the orchestration caller.
//!
//! The caller supplies a callback URL in the event; the outcome is `PUT`
//! there as a JSON document.  Delivery is attempted once and never retried.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{LifecycleEvent, Outcome, OutcomeStatus};

const DEFAULT_REASON: &str = "See the function logs for details";

/// Body of the callback `PUT`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackBody<'a> {
    pub status: OutcomeStatus,
    pub reason: &'a str,
    pub physical_resource_id: &'a str,
    pub stack_id: &'a str,
    pub request_id: &'a str,
    pub logical_resource_id: &'a str,
    pub no_echo: bool,
}

impl<'a> CallbackBody<'a> {
    pub fn new(event: &'a LifecycleEvent, outcome: &'a Outcome) -> Self {
        Self {
            status: outcome.status,
            reason: outcome.reason.as_deref().unwrap_or(DEFAULT_REASON),
            physical_resource_id: event.physical_id(),
            stack_id: &event.stack_id,
            request_id: &event.request_id,
            logical_resource_id: &event.logical_resource_id,
            no_echo: false,
        }
    }
}

/// Sink for the single outcome report of an invocation.
#[async_trait::async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn report(&self, event: &LifecycleEvent, outcome: &Outcome) -> Result<()>;
}

/// [`OutcomeReporter`] that `PUT`s to the event's `ResponseURL`.
pub struct CallbackReporter {
    client: reqwest::Client,
}

impl CallbackReporter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl OutcomeReporter for CallbackReporter {
    #[instrument(skip_all, fields(request_id = %event.request_id, status = ?outcome.status))]
    async fn report(&self, event: &LifecycleEvent, outcome: &Outcome) -> Result<()> {
        let Some(url) = event.response_url.as_deref().filter(|u| !u.is_empty()) else {
            warn!("no ResponseURL in event; outcome not delivered");
            return Ok(());
        };

        let body = serde_json::to_vec(&CallbackBody::new(event, outcome))
            .context("serialise callback body")?;

        let resp = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("send outcome to ResponseURL")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("ResponseURL rejected outcome: HTTP {status}");
        }
        info!(%status, "outcome delivered");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;

    use super::*;

    /// One `PUT` received by [`spawn_callback`].
    #[derive(Debug, Clone)]
    pub(crate) struct ReceivedPut {
        pub content_type: Option<String>,
        pub body: serde_json::Value,
    }

    /// Accept `PUT /cb` on an ephemeral local port, answering `status`.
    /// Returns the callback URL and the requests received so far.
    pub(crate) async fn spawn_callback(
        status: StatusCode,
    ) -> (String, Arc<Mutex<Vec<ReceivedPut>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let app = axum::Router::new().route(
            "/cb",
            axum::routing::put(move |headers: HeaderMap, body: Bytes| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(ReceivedPut {
                        content_type: headers
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
                    });
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/cb"), received)
    }

    pub(crate) fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn event(json: serde_json::Value) -> LifecycleEvent {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn body_uses_orchestrator_field_names() {
        let event = event(serde_json::json!({
            "RequestType": "Create",
            "ResponseURL": "https://example.com/cb",
            "StackId": "stack-1",
            "RequestId": "req-1",
            "LogicalResourceId": "PopulateRepo",
            "ResourceProperties": { "RepositoryName": "demo-repo" }
        }));
        let outcome = Outcome::failed("boom");
        let body = serde_json::to_value(CallbackBody::new(&event, &outcome)).unwrap();

        assert_eq!(body["Status"], "FAILED");
        assert_eq!(body["Reason"], "boom");
        assert_eq!(body["PhysicalResourceId"], "demo-repo");
        assert_eq!(body["StackId"], "stack-1");
        assert_eq!(body["RequestId"], "req-1");
        assert_eq!(body["LogicalResourceId"], "PopulateRepo");
        assert_eq!(body["NoEcho"], false);
    }

    #[test]
    fn body_keeps_existing_physical_id_and_default_reason() {
        let event = event(serde_json::json!({
            "RequestType": "Delete",
            "StackId": "stack-1",
            "RequestId": "req-2",
            "LogicalResourceId": "PopulateRepo",
            "PhysicalResourceId": "existing-id",
            "ResourceProperties": { "RepositoryName": "demo-repo" }
        }));
        let outcome = Outcome::success();
        let body = serde_json::to_value(CallbackBody::new(&event, &outcome)).unwrap();

        assert_eq!(body["Status"], "SUCCESS");
        assert_eq!(body["Reason"], DEFAULT_REASON);
        assert_eq!(body["PhysicalResourceId"], "existing-id");
    }

    #[tokio::test]
    async fn missing_response_url_is_not_an_error() {
        let event = event(serde_json::json!({ "RequestType": "Delete" }));
        let reporter = CallbackReporter::new(reqwest::Client::new());
        reporter.report(&event, &Outcome::success()).await.unwrap();
    }

    #[tokio::test]
    async fn outcome_is_put_as_json() {
        let (url, received) = spawn_callback(StatusCode::OK).await;
        let event = event(serde_json::json!({
            "RequestType": "Create",
            "ResponseURL": url,
            "StackId": "stack-1",
            "RequestId": "req-3",
            "LogicalResourceId": "PopulateRepo",
            "ResourceProperties": { "RepositoryName": "demo-repo" }
        }));

        CallbackReporter::new(local_client())
            .report(&event, &Outcome::failed("fetch failed"))
            .await
            .unwrap();

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(received[0].body["Status"], "FAILED");
        assert_eq!(received[0].body["Reason"], "fetch failed");
        assert_eq!(received[0].body["RequestId"], "req-3");
        assert_eq!(received[0].body["PhysicalResourceId"], "demo-repo");
    }

    #[tokio::test]
    async fn rejected_callback_is_an_error() {
        let (url, received) = spawn_callback(StatusCode::INTERNAL_SERVER_ERROR).await;
        let event = event(serde_json::json!({ "RequestType": "Delete", "ResponseURL": url }));

        let err = CallbackReporter::new(local_client())
            .report(&event, &Outcome::success())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("HTTP 500"), "{err:#}");
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
