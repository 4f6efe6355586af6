//! Command-line firmware deployment.
//!
//! Creates one deployment job for a device, then records the new version on
//! the device's registry entry using the record version read just before
//! the update as the expected version.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, instrument, warn};

use crate::config::FleetConfig;
use crate::fleet::job::FIRMWARE_VERSION_ATTRIBUTE;
use crate::fleet::{AttributeUpdate, FleetRegistry, JobCreated, UpdateRequest, dispatch_update};

/// Attribute marking a device as enrolled in over-the-air updates.
pub const OTA_SUPPORT_ATTRIBUTE: &str = "OTA_Support";

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Firmware version to deploy.
    pub version: String,

    /// Target thing; defaults to `fleet.default_thing_name`.
    #[arg(long = "thing_name")]
    pub thing_name: Option<String>,

    /// Job id; a fresh UUID when omitted.
    #[arg(long = "job_id")]
    pub job_id: Option<String>,

    /// Account id; resolved from the caller identity when omitted.
    #[arg(long = "account_id")]
    pub account_id: Option<String>,

    /// Region; defaults to `aws.region`.
    #[arg(long)]
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub job: JobCreated,
    pub attributes: AttributeUpdate,
}

/// Create the job, then merge the version attributes onto the thing.
///
/// A failed job creation returns an error and leaves the thing untouched.
/// A concurrent change to the thing record is logged and not treated as a
/// failure.
#[instrument(skip(registry, fleet, args), fields(version = %args.version))]
pub async fn run_deploy(
    registry: &dyn FleetRegistry,
    fleet: &FleetConfig,
    region: &str,
    args: DeployArgs,
) -> Result<DeployReport> {
    let thing_name = args
        .thing_name
        .unwrap_or_else(|| fleet.default_thing_name.clone());
    info!(%thing_name, %region, "creating deployment job");

    // The attribute merge below replaces the dispatch-time update.
    let settings = FleetConfig {
        record_attributes_on_dispatch: false,
        ..fleet.clone()
    };
    let job = dispatch_update(
        registry,
        region,
        &settings,
        UpdateRequest {
            thing_name: thing_name.clone(),
            version: args.version.clone(),
            job_id: args.job_id,
            account_id: args.account_id,
            description: Some(format!("Deployment to version {}", args.version)),
        },
    )
    .await
    .context("job creation failed, skipping attribute update")?;
    info!(job_id = %job.job_id, "job creation successful, updating thing attributes");

    let current = registry
        .describe_thing(&thing_name)
        .await
        .with_context(|| format!("describe thing {thing_name}"))?;
    info!(%thing_name, record_version = ?current.version, "current thing version");

    let attributes = HashMap::from([
        (FIRMWARE_VERSION_ATTRIBUTE.to_string(), args.version.clone()),
        (OTA_SUPPORT_ATTRIBUTE.to_string(), "True".to_string()),
    ]);
    let update = registry
        .update_thing_attributes(&thing_name, attributes, current.version)
        .await
        .with_context(|| format!("update thing {thing_name}"))?;

    match &update {
        AttributeUpdate::Applied => info!(%thing_name, "updated firmwareVersion attribute"),
        AttributeUpdate::VersionConflict(msg) => warn!(%thing_name, %msg, "version conflict"),
    }

    Ok(DeployReport {
        job,
        attributes: update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests::FakeFleet;

    fn args(version: &str) -> DeployArgs {
        DeployArgs {
            version: version.to_string(),
            thing_name: None,
            job_id: None,
            account_id: None,
            region: None,
        }
    }

    #[tokio::test]
    async fn deploys_to_default_thing_and_records_version() {
        let fleet = FakeFleet::with_things(&[("device-thing-1-agent", Some("1"), 7)]);
        let report = run_deploy(&fleet, &FleetConfig::default(), "us-east-1", args("2"))
            .await
            .unwrap();

        let jobs = fleet.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(report.job.job_id, jobs[0].job_id);
        assert_eq!(jobs[0].description, "Deployment to version 2");
        assert_eq!(
            jobs[0].targets,
            vec!["arn:aws:iot:us-east-1:123456789012:thing/device-thing-1-agent"]
        );

        let updates = fleet.updates();
        assert_eq!(updates.len(), 1);
        let (name, attributes, expected) = &updates[0];
        assert_eq!(name, "device-thing-1-agent");
        assert_eq!(attributes[FIRMWARE_VERSION_ATTRIBUTE], "2");
        assert_eq!(attributes[OTA_SUPPORT_ATTRIBUTE], "True");
        assert_eq!(*expected, Some(7));
        assert_eq!(report.attributes, AttributeUpdate::Applied);
    }

    #[tokio::test]
    async fn supplied_ids_are_used() {
        let fleet = FakeFleet::with_things(&[("robot-9", None, 1)]);
        let report = run_deploy(
            &fleet,
            &FleetConfig::default(),
            "eu-central-1",
            DeployArgs {
                thing_name: Some("robot-9".into()),
                job_id: Some("job-1".into()),
                account_id: Some("111122223333".into()),
                ..args("3")
            },
        )
        .await
        .unwrap();

        assert_eq!(report.job.job_id, "job-1");
        assert_eq!(*fleet.account_lookups.lock().unwrap(), 0);
        assert_eq!(
            fleet.jobs()[0].targets,
            vec!["arn:aws:iot:eu-central-1:111122223333:thing/robot-9"]
        );
    }

    #[tokio::test]
    async fn version_conflict_is_not_a_failure() {
        let mut fleet = FakeFleet::with_things(&[("device-thing-1-agent", None, 2)]);
        fleet.conflict_updates = true;
        let report = run_deploy(&fleet, &FleetConfig::default(), "us-east-1", args("2"))
            .await
            .unwrap();
        assert!(matches!(report.attributes, AttributeUpdate::VersionConflict(_)));
    }

    #[tokio::test]
    async fn job_failure_skips_attribute_update() {
        let mut fleet = FakeFleet::with_things(&[("device-thing-1-agent", None, 2)]);
        fleet.fail_jobs = true;
        let err = run_deploy(&fleet, &FleetConfig::default(), "us-east-1", args("2"))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("skipping attribute update"));
        assert!(fleet.updates().is_empty());
    }

    #[tokio::test]
    async fn dispatch_time_update_is_not_duplicated() {
        let fleet = FakeFleet::with_things(&[("device-thing-1-agent", None, 2)]);
        let config = FleetConfig {
            record_attributes_on_dispatch: true,
            ..FleetConfig::default()
        };
        run_deploy(&fleet, &config, "us-east-1", args("2"))
            .await
            .unwrap();
        assert_eq!(fleet.updates().len(), 1);
    }
}
