use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::bootstrap::scratch::leftover_scratch_entries;
use crate::config::Config;

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
    pub scratch_root: CheckResult,
    pub leftover_scratch: CheckResult,
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
// Individual checks
// ---------------------------------------------------------------------------

/// The scratch root must be a directory we can create files in.
fn check_scratch_root(root: &Path) -> CheckResult {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return CheckResult::unhealthy(format!("{} is not a directory", root.display())),
        Err(e) => return CheckResult::unhealthy(format!("{}: {e}", root.display())),
    }

    let probe = root.join(format!(".firmware-ota-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::healthy()
        }
        Err(e) => CheckResult::unhealthy(format!("{} is not writable: {e}", root.display())),
    }
}

/// Scratch entries left behind by an interrupted invocation.
fn check_leftovers(root: &Path) -> CheckResult {
    match leftover_scratch_entries(root) {
        Ok(0) => CheckResult::healthy(),
        Ok(n) => CheckResult::unhealthy(format!("{n} leftover scratch entries")),
        Err(e) => CheckResult::unhealthy(format!("scan failed: {e:#}")),
    }
}

fn run_checks(root: &Path) -> HealthChecks {
    let scratch_root = check_scratch_root(root);
    let leftover_scratch = if scratch_root.ok {
        check_leftovers(root)
    } else {
        CheckResult::unhealthy("skipped")
    };
    HealthChecks {
        scratch_root,
        leftover_scratch,
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.scratch_root.ok {
        HealthStatus::Unhealthy
    } else if !checks.leftover_scratch.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(config): State<Arc<Config>>) -> impl IntoResponse {
    let root = std::path::PathBuf::from(&config.bootstrap.scratch_root);
    let checks = match tokio::task::spawn_blocking(move || run_checks(&root)).await {
        Ok(checks) => checks,
        Err(e) => HealthChecks {
            scratch_root: CheckResult::unhealthy(format!("health check task failed: {e}")),
            leftover_scratch: CheckResult::unhealthy("skipped"),
        },
    };

    let status = aggregate_status(&checks);
    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(HealthResponse { status, checks }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_scratch_root_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let checks = run_checks(dir.path());
        assert_eq!(aggregate_status(&checks), HealthStatus::Ok);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn leftovers_degrade() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("staging_1_2_3")).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let checks = run_checks(dir.path());
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
        assert_eq!(
            checks.leftover_scratch.detail.as_deref(),
            Some("1 leftover scratch entries")
        );
    }

    #[test]
    fn missing_root_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let checks = run_checks(&dir.path().join("absent"));
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn handler_returns_503_when_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.bootstrap.scratch_root = dir.path().join("file").display().to_string();
        std::fs::write(&config.bootstrap.scratch_root, b"").unwrap();

        let response = health_handler(State(Arc::new(config))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
