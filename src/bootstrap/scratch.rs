//! Per-invocation scratch locations.
//!
//! Every create/update invocation gets a download file, an extraction
//! directory and a staging directory whose names share a token derived from
//! the current millisecond timestamp.  A process-wide sequence number is
//! appended so that two invocations in the same millisecond never collide.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// File-name prefixes of the three scratch locations.
pub const SCRATCH_PREFIXES: [&str; 3] = ["repo_", "source_", "staging_"];

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// The three scratch locations owned by one invocation.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    pub download: PathBuf,
    pub extract: PathBuf,
    pub staging: PathBuf,
}

impl ScratchSpace {
    /// Reserve uniquely named scratch locations under `root`.
    ///
    /// Nothing is created on disk here; the extraction and staging
    /// directories are created by [`ScratchSpace::prepare`].
    pub fn allocate(root: &Path) -> Self {
        let token = scratch_token();
        Self {
            download: root.join(format!("repo_{token}.zip")),
            extract: root.join(format!("source_{token}")),
            staging: root.join(format!("staging_{token}")),
        }
    }

    /// Create the extraction and staging directories.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.extract, &self.staging] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create scratch dir: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Remove all three locations, best-effort.
    ///
    /// Missing locations are not an error.  Returns the number of locations
    /// that could not be removed; each failure is logged.
    pub fn release(&self) -> usize {
        let mut failures = 0;
        for path in [&self.download, &self.extract, &self.staging] {
            if let Err(e) = remove_path(path) {
                warn!(path = %path.display(), error = %e, "failed to release scratch location");
                failures += 1;
            }
        }
        debug!(failures, "scratch space released");
        failures
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn scratch_token() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{millis}_{}_{seq}", std::process::id())
}

/// Count entries directly under `root` that look like scratch locations.
pub fn leftover_scratch_entries(root: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read scratch root: {}", root.display()))?;
    let mut count = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if SCRATCH_PREFIXES.iter().any(|p| name.starts_with(p)) {
            count += 1;
        }
    }
    Ok(count)
}
