//! Minimal Git abstraction consumed by piped
//!
//! Only the operations piped needs are exposed. [`cli`] implements them on
//! top of the `git` binary.

pub mod cli;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipedError;

pub use cli::{CliGitClient, CliRepo};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommit {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub created_at: i64,
}

/// A cloned working copy
#[async_trait]
pub trait Repo: Send + Sync {
    fn path(&self) -> &Path;

    fn cloned_branch(&self) -> &str;

    async fn latest_commit(&self) -> Result<GitCommit, PipedError>;

    async fn commit(&self, rev: &str) -> Result<GitCommit, PipedError>;

    /// Files changed between two revisions, relative to the repository root
    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, PipedError>;

    async fn checkout(&self, commitish: &str) -> Result<(), PipedError>;

    async fn pull(&self, branch: &str) -> Result<(), PipedError>;

    /// Merge `commit` of the remote `branch` into the current branch.
    /// Fails with a `Conflict` error when the merge cannot be done automatically.
    async fn merge_remote_branch(
        &self,
        branch: &str,
        commit: &str,
        message: &str,
    ) -> Result<(), PipedError>;

    /// Copy the working copy to `dest` and return the copy
    async fn copy(&self, dest: &Path) -> Result<Box<dyn Repo>, PipedError>;

    async fn clean(&self) -> Result<(), PipedError>;
}

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Clone `remote` at `branch` into `dest`
    async fn clone_repo(
        &self,
        repo_id: &str,
        remote: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<Box<dyn Repo>, PipedError>;
}

/// Copy a directory tree with `cp -rf`, preserving file modes
pub async fn copy_dir(src: &Path, dest: &Path) -> Result<(), PipedError> {
    let output = tokio::process::Command::new("cp")
        .arg("-rf")
        .arg(src)
        .arg(dest)
        .output()
        .await?;
    if !output.status.success() {
        return Err(PipedError::Internal(format!(
            "failed to copy {} to {}: {}",
            src.display(),
            dest.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
