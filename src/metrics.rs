use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::bootstrap::OutcomeStatus;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub status: Status,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    Success,
    Failed,
}

impl From<OutcomeStatus> for Status {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => Self::Success,
            OutcomeStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- bootstrap --
    pub bootstrap_total: Family<OutcomeLabels, Counter>,
    pub bootstrap_duration_seconds: Histogram,

    // -- fleet API --
    pub fleet_api_calls: Family<OperationLabels, Counter>,
    pub jobs_created: Counter,

    // -- HTTP --
    pub http_requests: Family<EndpointLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let bootstrap_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "firmware_ota_bootstrap",
            "Repository bootstrap invocations by outcome",
            bootstrap_total.clone(),
        );

        let bootstrap_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 10));
        registry.register(
            "firmware_ota_bootstrap_duration_seconds",
            "Repository bootstrap latency in seconds",
            bootstrap_duration_seconds.clone(),
        );

        let fleet_api_calls = Family::<OperationLabels, Counter>::default();
        registry.register(
            "firmware_ota_fleet_api_calls",
            "Fleet registry and job service calls by operation",
            fleet_api_calls.clone(),
        );

        let jobs_created = Counter::default();
        registry.register(
            "firmware_ota_jobs_created",
            "Firmware deployment jobs created",
            jobs_created.clone(),
        );

        let http_requests = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "firmware_ota_http_requests",
            "HTTP requests by endpoint",
            http_requests.clone(),
        );

        Self {
            bootstrap_total,
            bootstrap_duration_seconds,
            fleet_api_calls,
            jobs_created,
            http_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn record_bootstrap(&self, status: OutcomeStatus, seconds: f64) {
        self.metrics
            .bootstrap_total
            .get_or_create(&OutcomeLabels {
                status: status.into(),
            })
            .inc();
        self.metrics.bootstrap_duration_seconds.observe(seconds);
    }

    pub fn record_fleet_call(&self, operation: &str) {
        self.metrics
            .fleet_api_calls
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_request(&self, endpoint: &str) {
        self.metrics
            .http_requests
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
