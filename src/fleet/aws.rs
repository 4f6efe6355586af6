//! AWS IoT Core + STS backed [`FleetRegistry`].

use std::collections::HashMap;

use anyhow::{Context, Result};
use aws_sdk_iot::types::{AttributePayload, TargetSelection};
use tracing::{debug, instrument};

use super::{AttributeUpdate, FleetRegistry, JobCreated, JobRequest, ThingDescription};
use crate::metrics::MetricsRegistry;

pub struct AwsFleet {
    iot: aws_sdk_iot::Client,
    sts: aws_sdk_sts::Client,
    metrics: MetricsRegistry,
}

impl AwsFleet {
    pub fn new(iot: aws_sdk_iot::Client, sts: aws_sdk_sts::Client, metrics: MetricsRegistry) -> Self {
        Self { iot, sts, metrics }
    }
}

#[async_trait::async_trait]
impl FleetRegistry for AwsFleet {
    /// Automatically paginates through all results.
    #[instrument(skip(self))]
    async fn list_thing_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            self.metrics.record_fleet_call("ListThings");
            let resp = self
                .iot
                .list_things()
                .set_next_token(next_token.take())
                .send()
                .await
                .context("IoT ListThings")?;

            for thing in resp.things() {
                if let Some(name) = thing.thing_name() {
                    names.push(name.to_string());
                }
            }

            match resp.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(count = names.len(), "listed things");
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn describe_thing(&self, name: &str) -> Result<ThingDescription> {
        self.metrics.record_fleet_call("DescribeThing");
        let resp = self
            .iot
            .describe_thing()
            .thing_name(name)
            .send()
            .await
            .context("IoT DescribeThing")?;

        Ok(ThingDescription {
            name: resp.thing_name().unwrap_or(name).to_string(),
            attributes: resp.attributes().cloned().unwrap_or_default(),
            version: Some(resp.version()),
        })
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn create_job(&self, request: JobRequest) -> Result<JobCreated> {
        self.metrics.record_fleet_call("CreateJob");
        let resp = self
            .iot
            .create_job()
            .job_id(&request.job_id)
            .set_targets(Some(request.targets))
            .document(request.document)
            .description(request.description)
            .target_selection(TargetSelection::Snapshot)
            .send()
            .await
            .context("IoT CreateJob")?;

        self.metrics.metrics.jobs_created.inc();
        Ok(JobCreated {
            job_id: resp.job_id().unwrap_or(&request.job_id).to_string(),
            job_arn: resp.job_arn().map(str::to_string),
        })
    }

    #[instrument(skip(self, attributes))]
    async fn update_thing_attributes(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
        expected_version: Option<i64>,
    ) -> Result<AttributeUpdate> {
        self.metrics.record_fleet_call("UpdateThing");
        let payload = AttributePayload::builder()
            .set_attributes(Some(attributes))
            .merge(true)
            .build();

        match self
            .iot
            .update_thing()
            .thing_name(name)
            .attribute_payload(payload)
            .set_expected_version(expected_version)
            .send()
            .await
        {
            Ok(_) => Ok(AttributeUpdate::Applied),
            Err(err) => {
                if let Some(conflict) = err
                    .as_service_error()
                    .filter(|e| e.is_version_conflict_exception())
                {
                    Ok(AttributeUpdate::VersionConflict(conflict.to_string()))
                } else {
                    Err(err).context("IoT UpdateThing")
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn caller_account_id(&self) -> Result<String> {
        self.metrics.record_fleet_call("GetCallerIdentity");
        let resp = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .context("STS GetCallerIdentity")?;
        resp.account()
            .map(str::to_string)
            .context("caller identity has no account id")
    }
}
