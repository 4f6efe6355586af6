//! Source archive handling: fetch, extract, locate, stage and batch.
//!
//! Everything after the fetch is plain blocking filesystem work; callers run
//! it on the blocking pool.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::repository::{FileEntry, FileMode};

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Transfer of a source archive from its host.
#[async_trait::async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Download the archive at `url`.  Any non-success status is an error.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// [`ArchiveSource`] backed by a plain HTTP GET.
pub struct HttpArchiveSource {
    client: reqwest::Client,
}

impl HttpArchiveSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ArchiveSource for HttpArchiveSource {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("failed to download repository: HTTP {status}");
        }

        let body = resp
            .bytes()
            .await
            .with_context(|| format!("read body of {url}"))?;
        debug!(bytes = body.len(), "archive downloaded");
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

/// Unpack every entry of the zip archive at `archive` under `dest`.
///
/// Entries whose names would escape `dest` are skipped.  Returns the number
/// of files written.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open archive: {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(std::io::BufReader::new(file))
        .with_context(|| format!("failed to open zip archive: {}", archive.display()))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("failed to read zip entry #{index}"))?;

        let Some(relative) = entry.enclosed_name().map(|p| p.to_owned()) else {
            warn!(name = entry.name(), "skipping zip entry outside extraction root");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to write {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o777))
                .with_context(|| format!("failed to set permissions on {}", target.display()))?;
        }

        written += 1;
    }

    debug!(files = written, dest = %dest.display(), "archive extracted");
    Ok(written)
}

// ---------------------------------------------------------------------------
// Layout discovery
// ---------------------------------------------------------------------------

/// Return the top-level directory produced by extraction.
///
/// Archives from a forge contain exactly one root folder; when several
/// exist the first in name order wins.
pub fn find_root_dir(extract_dir: &Path) -> Result<PathBuf> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(extract_dir)
        .with_context(|| format!("failed to list {}", extract_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs.into_iter()
        .next()
        .context("could not find extracted directory")
}

/// Return `root/<subtree>` if it exists as a directory.
pub fn locate_subtree(root: &Path, subtree: &str) -> Result<PathBuf> {
    let path = root.join(subtree);
    if !path.is_dir() {
        bail!("{subtree} directory not found in repository");
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Copy `source` into `staging`, then drop `staging/<excluded_dir>`.
///
/// Symlinks are not followed and not copied.  Returns the number of files
/// copied before the exclusion.
pub fn stage_subtree(source: &Path, staging: &Path, excluded_dir: &str) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source)?;
        let target = staging.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }

    let excluded = staging.join(excluded_dir);
    if excluded.exists() {
        std::fs::remove_dir_all(&excluded)
            .with_context(|| format!("failed to remove {}", excluded.display()))?;
        debug!(path = %excluded.display(), "removed excluded directory from staging");
    }

    Ok(copied)
}

// ---------------------------------------------------------------------------
// File batch
// ---------------------------------------------------------------------------

/// Build the commit batch from every regular file under `staging`.
///
/// Paths are relative to `staging` and always `/`-separated.  Entries are
/// ordered by path.
pub fn build_file_batch(staging: &Path) -> Result<Vec<FileEntry>> {
    let mut batch = Vec::new();
    for entry in WalkDir::new(staging).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", staging.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(staging)?;
        let content = std::fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;

        batch.push(FileEntry {
            path: slash_path(relative),
            mode: file_mode(&metadata),
            content,
        });
    }
    Ok(batch)
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        FileMode::Executable
    } else {
        FileMode::Normal
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> FileMode {
    FileMode::Normal
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
