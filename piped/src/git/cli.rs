//! `git` binary backed implementation

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::errors::PipedError;
use crate::git::{copy_dir, GitClient, GitCommit, Repo};

const FIELD_SEPARATOR: &str = "\u{1f}";
const COMMIT_LOG_FORMAT: &str = "%H%x1f%an%x1f%ct%x1f%s";

#[derive(Debug, Clone)]
pub struct CliGitClient {
    git_path: PathBuf,
    username: String,
    email: String,
}

impl CliGitClient {
    pub fn new(username: &str, email: &str) -> Result<Self, PipedError> {
        let git_path = which::which("git")
            .map_err(|e| PipedError::Config(format!("git binary was not found: {}", e)))?;
        Ok(Self {
            git_path,
            username: username.to_string(),
            email: email.to_string(),
        })
    }
}

#[async_trait]
impl GitClient for CliGitClient {
    async fn clone_repo(
        &self,
        repo_id: &str,
        remote: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<Box<dyn Repo>, PipedError> {
        info!("Cloning repository {} ({}) at branch {} to {}", repo_id, remote, branch, dest.display());

        let mut cmd = Command::new(&self.git_path);
        cmd.arg("clone");
        // Empty branch clones the remote's default branch
        if !branch.is_empty() {
            cmd.arg("--branch").arg(branch);
        }
        let output = cmd.arg(remote).arg(dest).output().await?;
        if !output.status.success() {
            let out = String::from_utf8_lossy(&output.stderr);
            error!("Failed to clone repository {}: {}", repo_id, out);
            return Err(PipedError::Git(format!(
                "failed to clone repository {}: {}",
                repo_id,
                out.trim()
            )));
        }

        let repo = CliRepo::new(dest.to_path_buf(), self.git_path.clone(), remote, branch);
        if !self.username.is_empty() {
            repo.run(&["config", "user.name", &self.username]).await?;
        }
        if !self.email.is_empty() {
            repo.run(&["config", "user.email", &self.email]).await?;
        }
        Ok(Box::new(repo))
    }
}

#[derive(Debug, Clone)]
pub struct CliRepo {
    dir: PathBuf,
    git_path: PathBuf,
    remote: String,
    cloned_branch: String,
}

impl CliRepo {
    pub fn new(dir: PathBuf, git_path: PathBuf, remote: &str, cloned_branch: &str) -> Self {
        Self {
            dir,
            git_path,
            remote: remote.to_string(),
            cloned_branch: cloned_branch.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, PipedError> {
        debug!("Running git {:?} in {}", args, self.dir.display());
        let output = Command::new(&self.git_path)
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipedError::Git(format!(
                "git {} failed: {}{}",
                args.first().copied().unwrap_or_default(),
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

fn parse_commits(out: &str) -> Result<Vec<GitCommit>, PipedError> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(4, FIELD_SEPARATOR).collect();
            if fields.len() != 4 {
                return Err(PipedError::Git(format!("malformed commit log line {:?}", line)));
            }
            Ok(GitCommit {
                hash: fields[0].to_string(),
                author: fields[1].to_string(),
                created_at: fields[2].parse().unwrap_or_default(),
                message: fields[3].to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl Repo for CliRepo {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn cloned_branch(&self) -> &str {
        &self.cloned_branch
    }

    async fn latest_commit(&self) -> Result<GitCommit, PipedError> {
        self.commit("HEAD").await
    }

    async fn commit(&self, rev: &str) -> Result<GitCommit, PipedError> {
        let format = format!("--pretty=format:{}", COMMIT_LOG_FORMAT);
        let out = self
            .run(&["log", "--no-decorate", &format, "-1", rev])
            .await?;
        let mut commits = parse_commits(&out)?;
        if commits.len() != 1 {
            return Err(PipedError::Git(format!(
                "commits must contain one item, got: {}",
                commits.len()
            )));
        }
        Ok(commits.remove(0))
    }

    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, PipedError> {
        let out = self.run(&["diff", "--name-only", from, to]).await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn checkout(&self, commitish: &str) -> Result<(), PipedError> {
        self.run(&["checkout", commitish]).await.map(|_| ())
    }

    async fn pull(&self, branch: &str) -> Result<(), PipedError> {
        self.run(&["pull", "origin", branch]).await.map(|_| ())
    }

    async fn merge_remote_branch(
        &self,
        branch: &str,
        commit: &str,
        message: &str,
    ) -> Result<(), PipedError> {
        self.run(&["fetch", "origin", branch]).await?;
        match self.run(&["merge", "-q", "--no-ff", "-m", message, commit]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let _ = self.run(&["merge", "--abort"]).await;
                Err(PipedError::Conflict(e.to_string()))
            }
        }
    }

    async fn copy(&self, dest: &Path) -> Result<Box<dyn Repo>, PipedError> {
        copy_dir(&self.dir, dest).await?;
        Ok(Box::new(CliRepo::new(
            dest.to_path_buf(),
            self.git_path.clone(),
            &self.remote,
            &self.cloned_branch,
        )))
    }

    async fn clean(&self) -> Result<(), PipedError> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}
