//! Repository bootstrap procedure.
//!
//! Mirrors one subtree of a public source archive into a managed
//! version-control repository when the orchestrator creates or updates the
//! resource, and reports the outcome back exactly once per invocation.
//! Delete requests have no side effects: the mirrored repository is left in
//! place.

pub mod archive;
pub mod error;
pub mod report;
pub mod scratch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::config::BootstrapConfig;
use crate::metrics::MetricsRegistry;
use crate::repository::{CommitOutcome, CommitRequest, FileEntry, RepositoryStore};

use self::archive::ArchiveSource;
use self::error::{BootstrapError, Classify};
use self::report::OutcomeReporter;
use self::scratch::ScratchSpace;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceProperties {
    #[serde(rename = "RepositoryName")]
    pub repository_name: Option<String>,
}

/// Lifecycle request sent by the orchestration caller.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "RequestType")]
    pub request_type: RequestType,
    #[serde(rename = "ResponseURL", default)]
    pub response_url: Option<String>,
    #[serde(rename = "StackId", default)]
    pub stack_id: String,
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    #[serde(rename = "LogicalResourceId", default)]
    pub logical_resource_id: String,
    #[serde(rename = "PhysicalResourceId", default)]
    pub physical_resource_id: Option<String>,
    #[serde(rename = "ResourceProperties", default)]
    pub resource_properties: ResourceProperties,
}

impl LifecycleEvent {
    /// Target repository name, if present and non-empty.
    pub fn repository_name(&self) -> Option<&str> {
        self.resource_properties
            .repository_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }

    /// Reporting fields recovered from an event that failed typed decoding.
    ///
    /// Returns `None` when there is no `ResponseURL` to report to.  Fields
    /// that are missing or of the wrong type are left empty.
    pub fn salvage(value: &serde_json::Value) -> Option<Self> {
        let text = |key: &str| value.get(key).and_then(serde_json::Value::as_str);
        let response_url = text("ResponseURL").filter(|u| !u.is_empty())?;

        Some(Self {
            request_type: value
                .get("RequestType")
                .and_then(|v| RequestType::deserialize(v).ok())
                .unwrap_or(RequestType::Create),
            response_url: Some(response_url.to_string()),
            stack_id: text("StackId").unwrap_or_default().to_string(),
            request_id: text("RequestId").unwrap_or_default().to_string(),
            logical_resource_id: text("LogicalResourceId").unwrap_or_default().to_string(),
            physical_resource_id: text("PhysicalResourceId").map(str::to_string),
            resource_properties: ResourceProperties {
                repository_name: value
                    .pointer("/ResourceProperties/RepositoryName")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
            },
        })
    }

    /// Physical id reported back: the existing one, else the repository
    /// name, else the logical id.
    pub fn physical_id(&self) -> &str {
        self.physical_resource_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.repository_name())
            .unwrap_or(self.logical_resource_id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// What a successful create/update did.
#[derive(Debug, Clone)]
pub struct MirrorSummary {
    pub repository: String,
    pub created_repository: bool,
    pub files: usize,
    pub commit: CommitOutcome,
}

// ---------------------------------------------------------------------------
// Procedure
// ---------------------------------------------------------------------------

/// Runs bootstrap invocations against explicitly supplied collaborators.
pub struct Bootstrapper {
    settings: BootstrapConfig,
    archive: Arc<dyn ArchiveSource>,
    repositories: Arc<dyn RepositoryStore>,
    reporter: Arc<dyn OutcomeReporter>,
    metrics: MetricsRegistry,
}

impl Bootstrapper {
    pub fn new(
        settings: BootstrapConfig,
        archive: Arc<dyn ArchiveSource>,
        repositories: Arc<dyn RepositoryStore>,
        reporter: Arc<dyn OutcomeReporter>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            settings,
            archive,
            repositories,
            reporter,
            metrics,
        }
    }

    /// Handle one lifecycle event and report its outcome exactly once.
    ///
    /// Never fails: every error becomes a failed [`Outcome`].
    #[instrument(skip_all, fields(request_type = ?event.request_type, request_id = %event.request_id))]
    pub async fn handle(&self, event: &LifecycleEvent) -> Outcome {
        let started = Instant::now();

        let outcome = match event.request_type {
            RequestType::Delete => {
                info!("delete request; mirrored repository is retained");
                Outcome::success()
            }
            RequestType::Create | RequestType::Update => match self.mirror(event).await {
                Ok(summary) => {
                    info!(
                        repository = %summary.repository,
                        created_repository = summary.created_repository,
                        files = summary.files,
                        commit = ?summary.commit,
                        "repository population completed"
                    );
                    Outcome::success()
                }
                Err(e) => {
                    error!(kind = e.kind(), error = %e, "repository population failed");
                    Outcome::failed(e.to_string())
                }
            },
        };

        self.metrics
            .record_bootstrap(outcome.status, started.elapsed().as_secs_f64());
        self.deliver(event, &outcome).await;
        outcome
    }

    /// Handle an event that has not been decoded yet.
    ///
    /// An event that fails typed decoding but names a `ResponseURL` is
    /// reported as failed there, so the orchestrator is never left waiting.
    /// The decode error is returned only when no report could be addressed.
    pub async fn handle_value(
        &self,
        value: serde_json::Value,
    ) -> Result<Outcome, serde_json::Error> {
        let err = match LifecycleEvent::deserialize(&value) {
            Ok(event) => return Ok(self.handle(&event).await),
            Err(err) => err,
        };
        let Some(event) = LifecycleEvent::salvage(&value) else {
            return Err(err);
        };

        let reason = BootstrapError::InvalidRequest(err.to_string());
        warn!(request_id = %event.request_id, error = %reason, "malformed lifecycle event");
        let outcome = Outcome::failed(reason.to_string());
        self.metrics.record_bootstrap(outcome.status, 0.0);
        self.deliver(&event, &outcome).await;
        Ok(outcome)
    }

    async fn deliver(&self, event: &LifecycleEvent, outcome: &Outcome) {
        if let Err(e) = self.reporter.report(event, outcome).await {
            warn!(error = %e, "failed to report outcome to orchestrator");
        }
    }

    /// Create/update path: mirror inside freshly allocated scratch space.
    async fn mirror(&self, event: &LifecycleEvent) -> Result<MirrorSummary, BootstrapError> {
        let repository = event
            .repository_name()
            .ok_or_else(|| {
                BootstrapError::InvalidRequest("ResourceProperties.RepositoryName is required".into())
            })?
            .to_string();

        let scratch = ScratchSpace::allocate(Path::new(&self.settings.scratch_root));
        info!(
            download = %scratch.download.display(),
            extract = %scratch.extract.display(),
            staging = %scratch.staging.display(),
            "starting repository population"
        );

        let result = self.mirror_into(&scratch, repository).await;

        // Runs on every path that reaches here, success or failure.
        let failures = scratch.release();
        if failures > 0 {
            warn!(failures, "scratch space was not fully released");
        }
        result
    }

    async fn mirror_into(
        &self,
        scratch: &ScratchSpace,
        repository: String,
    ) -> Result<MirrorSummary, BootstrapError> {
        info!(url = %self.settings.source_url, "downloading repository archive");
        let archive = self
            .archive
            .fetch(&self.settings.source_url)
            .await
            .classify(BootstrapError::Fetch)?;

        let staged = {
            let scratch = scratch.clone();
            let subtree = self.settings.subtree.clone();
            let excluded = self.settings.excluded_dir.clone();
            tokio::task::spawn_blocking(move || stage(&scratch, archive, &subtree, &excluded))
                .await
                .map_err(|e| BootstrapError::Other(e.into()))??
        };
        info!(path = %staged.display(), "subtree staged");

        let created_repository = self.ensure_repository(&repository).await?;

        let files = {
            let staging = scratch.staging.clone();
            tokio::task::spawn_blocking(move || archive::build_file_batch(&staging))
                .await
                .map_err(|e| BootstrapError::Other(e.into()))?
                .classify(BootstrapError::Other)?
        };
        if files.is_empty() {
            return Err(BootstrapError::Structure(anyhow::anyhow!(
                "{} directory contains no files",
                self.settings.subtree
            )));
        }
        let file_count = files.len();

        let commit = self.publish(&repository, files).await?;

        Ok(MirrorSummary {
            repository,
            created_repository,
            files: file_count,
            commit,
        })
    }

    /// Look the repository up and create it when absent.  Returns whether it
    /// was created by this invocation.
    async fn ensure_repository(&self, repository: &str) -> Result<bool, BootstrapError> {
        let exists = self
            .repositories
            .repository_exists(repository)
            .await
            .classify(BootstrapError::Commit)?;
        if exists {
            info!(%repository, "repository already exists");
            return Ok(false);
        }

        self.repositories
            .create_repository(repository, &self.settings.repository_description)
            .await
            .classify(BootstrapError::Commit)?;
        info!(%repository, "repository created");
        Ok(true)
    }

    async fn publish(
        &self,
        repository: &str,
        files: Vec<FileEntry>,
    ) -> Result<CommitOutcome, BootstrapError> {
        let parent = self
            .repositories
            .branch_head(repository, &self.settings.branch)
            .await
            .classify(BootstrapError::Commit)?;

        self.repositories
            .commit(CommitRequest {
                repository,
                branch: &self.settings.branch,
                parent_commit_id: parent.as_deref(),
                author_name: &self.settings.author_name,
                email: &self.settings.author_email,
                message: &self.settings.commit_message,
                files,
            })
            .await
            .classify(BootstrapError::Commit)
    }
}

/// Write and extract the archive, find the subtree and stage it.
fn stage(
    scratch: &ScratchSpace,
    archive: Bytes,
    subtree: &str,
    excluded_dir: &str,
) -> Result<PathBuf, BootstrapError> {
    scratch.prepare().classify(BootstrapError::Other)?;
    std::fs::write(&scratch.download, &archive)
        .map_err(|e| BootstrapError::Other(anyhow::Error::new(e).context("write archive")))?;

    archive::extract_archive(&scratch.download, &scratch.extract)
        .classify(BootstrapError::Structure)?;
    let root = archive::find_root_dir(&scratch.extract).classify(BootstrapError::Structure)?;
    let source = archive::locate_subtree(&root, subtree).classify(BootstrapError::Structure)?;
    archive::stage_subtree(&source, &scratch.staging, excluded_dir)
        .classify(BootstrapError::Other)?;
    Ok(scratch.staging.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
