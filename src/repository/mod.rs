//! Managed version-control storage.
//!
//! Provides the [`RepositoryStore`] trait that the bootstrap procedure
//! publishes through, plus the CodeCommit implementation used in
//! production.

pub mod codecommit;

use anyhow::Result;

// ---------------------------------------------------------------------------
// File batch
// ---------------------------------------------------------------------------

/// Mode recorded for a committed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Normal,
    Executable,
}

/// One file of a commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub mode: FileMode,
    pub content: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Everything needed to submit one commit.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub repository: &'a str,
    pub branch: &'a str,
    /// Current head of `branch`, if the branch already exists.
    pub parent_commit_id: Option<&'a str>,
    pub author_name: &'a str,
    pub email: &'a str,
    pub message: &'a str,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new commit was written.
    Created { commit_id: String },
    /// The branch already holds exactly these files.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the hosted version-control service.
///
/// `commit` is atomic: either every file of the batch lands or none does.
#[async_trait::async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn repository_exists(&self, name: &str) -> Result<bool>;

    /// Create `name`.  Succeeds when the repository already exists.
    async fn create_repository(&self, name: &str, description: &str) -> Result<()>;

    /// Head commit of `branch`, or `None` when the branch does not exist.
    async fn branch_head(&self, name: &str, branch: &str) -> Result<Option<String>>;

    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitOutcome>;
}
