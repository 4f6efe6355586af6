use std::path::{Component, Path};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aws: AwsConfig,
    pub server: ServerConfig,
    pub fleet: FleetConfig,
    pub bootstrap: BootstrapConfig,
}

// ---------------------------------------------------------------------------
// AWS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Region used for IoT, STS and CodeCommit clients and for thing ARNs.
    pub region: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub http_listen: String,
    /// Value of `Access-Control-Allow-Origin` on every API response.
    pub cors_allow_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: "0.0.0.0:8080".to_string(),
            cors_allow_origin: "*".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fleet / jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Firmware versions offered to operators by `GET /versions`.
    pub firmware_versions: Vec<String>,
    /// Thing targeted by `deploy` when `--thing_name` is not given.
    pub default_thing_name: String,
    /// `operation` field embedded in every job document.
    pub job_operation: String,
    /// Merge the new `firmwareVersion` onto the thing right after the job
    /// is created instead of waiting for the device to report it.
    pub record_attributes_on_dispatch: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            firmware_versions: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            default_thing_name: "device-thing-1-agent".to_string(),
            job_operation: "Deploy-ROS-Firmware".to_string(),
            record_attributes_on_dispatch: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Zip archive of the source repository to mirror.
    pub source_url: String,
    /// Directory inside the archive root that gets published.
    pub subtree: String,
    /// Directory inside the subtree that is dropped before publishing.
    pub excluded_dir: String,
    /// Parent directory for per-invocation scratch locations.
    pub scratch_root: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    pub commit_message: String,
    /// Description used when the target repository has to be created.
    pub repository_description: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            source_url:
                "https://github.com/folotu/ros2-ota-firmware-updates/archive/refs/heads/main.zip"
                    .to_string(),
            subtree: "amplify".to_string(),
            excluded_dir: "infrastructure".to_string(),
            scratch_root: "/tmp".to_string(),
            branch: "main".to_string(),
            author_name: "Firmware OTA Bootstrap".to_string(),
            author_email: "firmware-ota@example.com".to_string(),
            commit_message: "Initial commit from CDK".to_string(),
            repository_description: "Amplify app repository".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.aws.region.is_empty(), "aws.region must not be empty");
    anyhow::ensure!(
        !config.fleet.firmware_versions.is_empty(),
        "fleet.firmware_versions must list at least one version"
    );
    anyhow::ensure!(
        !config.fleet.job_operation.is_empty(),
        "fleet.job_operation must not be empty"
    );

    anyhow::ensure!(
        axum::http::HeaderValue::from_str(&config.server.cors_allow_origin).is_ok(),
        "server.cors_allow_origin is not a valid header value: {:?}",
        config.server.cors_allow_origin
    );

    let source = url::Url::parse(&config.bootstrap.source_url)
        .with_context(|| format!("invalid bootstrap.source_url: {}", config.bootstrap.source_url))?;
    anyhow::ensure!(
        matches!(source.scheme(), "http" | "https"),
        "bootstrap.source_url must be http or https"
    );
    anyhow::ensure!(
        is_single_component(&config.bootstrap.subtree),
        "bootstrap.subtree must be a single directory name"
    );
    anyhow::ensure!(
        is_single_component(&config.bootstrap.excluded_dir),
        "bootstrap.excluded_dir must be a single directory name"
    );
    anyhow::ensure!(
        !config.bootstrap.branch.is_empty(),
        "bootstrap.branch must not be empty"
    );
    anyhow::ensure!(
        !config.bootstrap.scratch_root.is_empty(),
        "bootstrap.scratch_root must not be empty"
    );
    Ok(())
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
