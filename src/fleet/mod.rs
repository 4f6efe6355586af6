//! Fleet registry and job service.
//!
//! Provides the [`FleetRegistry`] trait over the managed device registry and
//! job service, and the two operations built on it: listing devices with
//! their installed firmware, and dispatching a firmware-update job.

pub mod aws;
pub mod job;

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::FleetConfig;

use self::job::{FIRMWARE_VERSION_ATTRIBUTE, JobDocument, thing_arn};

/// Reported for devices that never recorded a firmware version.
pub const UNKNOWN_VERSION: &str = "Unknown";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThingDescription {
    pub name: String,
    pub attributes: HashMap<String, String>,
    /// Registry record version, used as an optimistic-concurrency token.
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: String,
    pub targets: Vec<String>,
    /// Serialised [`JobDocument`].
    pub document: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobCreated {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeUpdate {
    Applied,
    /// The record changed since `expected_version` was read.
    VersionConflict(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait FleetRegistry: Send + Sync {
    /// Names of every registered thing.
    async fn list_thing_names(&self) -> Result<Vec<String>>;

    async fn describe_thing(&self, name: &str) -> Result<ThingDescription>;

    /// Create a snapshot-targeted job.
    async fn create_job(&self, request: JobRequest) -> Result<JobCreated>;

    /// Merge `attributes` into the thing's attributes.
    async fn update_thing_attributes(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
        expected_version: Option<i64>,
    ) -> Result<AttributeUpdate>;

    /// Account id of the credentials in use.
    async fn caller_account_id(&self) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Device listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub device_name: String,
    pub current_version: String,
}

/// Describe every registered thing and report its firmware version.
#[instrument(skip(registry))]
pub async fn list_devices(registry: &dyn FleetRegistry) -> Result<Vec<DeviceSummary>> {
    let names = registry.list_thing_names().await?;
    let mut devices = Vec::with_capacity(names.len());
    for name in names {
        let details = registry
            .describe_thing(&name)
            .await
            .with_context(|| format!("describe thing {name}"))?;
        let current_version = details
            .attributes
            .get(FIRMWARE_VERSION_ATTRIBUTE)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        devices.push(DeviceSummary {
            device_name: name,
            current_version,
        });
    }
    Ok(devices)
}

// ---------------------------------------------------------------------------
// Update dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub thing_name: String,
    pub version: String,
    /// Generated when absent.
    pub job_id: Option<String>,
    /// Resolved from the caller identity when absent.
    pub account_id: Option<String>,
    /// Defaults to `Firmware update to version {version}`.
    pub description: Option<String>,
}

/// Create a firmware-update job for one device.
///
/// When `fleet.record_attributes_on_dispatch` is set, the new version is
/// merged onto the thing after the job is created.  A failure there is
/// logged and does not undo the job.
#[instrument(skip(registry, fleet), fields(thing = %request.thing_name, version = %request.version))]
pub async fn dispatch_update(
    registry: &dyn FleetRegistry,
    region: &str,
    fleet: &FleetConfig,
    request: UpdateRequest,
) -> Result<JobCreated> {
    let account_id = match request.account_id {
        Some(id) => id,
        None => registry
            .caller_account_id()
            .await
            .context("resolve account id")?,
    };
    let job_id = request
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let document = JobDocument::new(&fleet.job_operation, &request.thing_name, &request.version)
        .to_json()
        .context("serialise job document")?;

    let created = registry
        .create_job(JobRequest {
            job_id,
            targets: vec![thing_arn(region, &account_id, &request.thing_name)],
            document,
            description: request
                .description
                .unwrap_or_else(|| format!("Firmware update to version {}", request.version)),
        })
        .await
        .context("create job")?;
    info!(job_id = %created.job_id, "job created");

    if fleet.record_attributes_on_dispatch {
        let attributes = HashMap::from([(
            FIRMWARE_VERSION_ATTRIBUTE.to_string(),
            request.version.clone(),
        )]);
        match registry
            .update_thing_attributes(&request.thing_name, attributes, None)
            .await
        {
            Ok(AttributeUpdate::Applied) => info!("thing attributes updated"),
            Ok(AttributeUpdate::VersionConflict(msg)) => {
                warn!(%msg, "thing attributes changed concurrently")
            }
            Err(e) => warn!(error = %e, "failed to update thing attributes"),
        }
    }

    Ok(created)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
