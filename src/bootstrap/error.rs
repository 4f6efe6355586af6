//! Failure classification for the bootstrap procedure.

use thiserror::Error;

/// Error raised by one step of a create/update invocation.
///
/// The variant is chosen by the step that failed, not by inspecting the
/// underlying cause.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The source archive could not be transferred.
    #[error("failed to fetch source archive: {0:#}")]
    Fetch(anyhow::Error),
    /// The archive does not have the expected layout.
    #[error("unexpected archive structure: {0:#}")]
    Structure(anyhow::Error),
    /// The version-control service rejected the repository or commit.
    #[error("failed to publish to repository: {0:#}")]
    Commit(anyhow::Error),
    /// The orchestration event is missing required properties.
    #[error("invalid bootstrap request: {0}")]
    InvalidRequest(String),
    /// Anything else (scratch allocation, blocking task failures, ...).
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl BootstrapError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Structure(_) => "structure",
            Self::Commit(_) => "commit",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Other(_) => "other",
        }
    }
}

/// Attach a [`BootstrapError`] kind to an `anyhow` result.
pub(crate) trait Classify<T> {
    fn classify(self, kind: fn(anyhow::Error) -> BootstrapError) -> Result<T, BootstrapError>;
}

impl<T> Classify<T> for anyhow::Result<T> {
    fn classify(self, kind: fn(anyhow::Error) -> BootstrapError) -> Result<T, BootstrapError> {
        self.map_err(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause_chain() {
        let err = BootstrapError::Fetch(
            anyhow::anyhow!("HTTP 404 Not Found").context("GET https://example.com/a.zip"),
        );
        let text = err.to_string();
        assert!(text.starts_with("failed to fetch source archive"));
        assert!(text.contains("HTTP 404"));
        assert_eq!(err.kind(), "fetch");
    }

    #[test]
    fn classify_maps_step_error() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("no root directory"));
        let err = result.classify(BootstrapError::Structure).unwrap_err();
        assert_eq!(err.kind(), "structure");
    }
}
