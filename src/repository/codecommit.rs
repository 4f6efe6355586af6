//! CodeCommit-backed [`RepositoryStore`].

use anyhow::{Context, Result};
use aws_sdk_codecommit::Client;
use aws_sdk_codecommit::primitives::Blob;
use aws_sdk_codecommit::types::{FileModeTypeEnum, PutFileEntry};
use tracing::{debug, info, instrument};

use super::{CommitOutcome, CommitRequest, FileEntry, FileMode, RepositoryStore};

pub struct CodeCommitStore {
    client: Client,
}

impl CodeCommitStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl RepositoryStore for CodeCommitStore {
    #[instrument(skip(self))]
    async fn repository_exists(&self, name: &str) -> Result<bool> {
        match self.client.get_repository().repository_name(name).send().await {
            Ok(_) => {
                debug!("repository already exists");
                Ok(true)
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_repository_does_not_exist_exception())
                {
                    debug!("repository does not exist");
                    Ok(false)
                } else {
                    Err(err).context("CodeCommit GetRepository")
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn create_repository(&self, name: &str, description: &str) -> Result<()> {
        match self
            .client
            .create_repository()
            .repository_name(name)
            .repository_description(description)
            .send()
            .await
        {
            Ok(_) => {
                info!("repository created");
                Ok(())
            }
            Err(err) => {
                // Lost a create race against a concurrent invocation.
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_repository_name_exists_exception())
                {
                    info!("repository created concurrently");
                    Ok(())
                } else {
                    Err(err).context("CodeCommit CreateRepository")
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn branch_head(&self, name: &str, branch: &str) -> Result<Option<String>> {
        match self
            .client
            .get_branch()
            .repository_name(name)
            .branch_name(branch)
            .send()
            .await
        {
            Ok(resp) => Ok(resp
                .branch()
                .and_then(|b| b.commit_id())
                .map(str::to_string)),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_branch_does_not_exist_exception())
                {
                    Ok(None)
                } else {
                    Err(err).context("CodeCommit GetBranch")
                }
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(repository = %request.repository, branch = %request.branch, files = request.files.len())
    )]
    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitOutcome> {
        let put_files = request
            .files
            .into_iter()
            .map(put_file_entry)
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .create_commit()
            .repository_name(request.repository)
            .branch_name(request.branch)
            .set_parent_commit_id(request.parent_commit_id.map(str::to_string))
            .author_name(request.author_name)
            .email(request.email)
            .commit_message(request.message)
            .set_put_files(Some(put_files))
            .send()
            .await;

        match result {
            Ok(resp) => {
                let commit_id = resp
                    .commit_id()
                    .context("CodeCommit CreateCommit returned no commit id")?
                    .to_string();
                info!(%commit_id, "commit created");
                Ok(CommitOutcome::Created { commit_id })
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_change_exception())
                {
                    info!("branch already holds these files");
                    Ok(CommitOutcome::Unchanged)
                } else {
                    Err(err).context("CodeCommit CreateCommit")
                }
            }
        }
    }
}

fn put_file_entry(file: FileEntry) -> Result<PutFileEntry> {
    let mode = match file.mode {
        FileMode::Normal => FileModeTypeEnum::Normal,
        FileMode::Executable => FileModeTypeEnum::Executable,
    };
    PutFileEntry::builder()
        .file_path(&file.path)
        .file_mode(mode)
        .file_content(Blob::new(file.content))
        .build()
        .with_context(|| format!("invalid commit entry: {}", file.path))
}
