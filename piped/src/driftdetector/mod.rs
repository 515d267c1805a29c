//! Drift detection
//!
//! A [`Detector`] watches the applications bound to one platform provider.
//! Each pass pulls the repositories those applications live in, compares the
//! state declared at the head commit with the live one and reports an
//! [`ApplicationSyncState`]. Nothing but the cloned repositories and the
//! loaded manifests is kept between passes.

mod cloudrun;
mod ecs;
mod kubernetes;
mod terraform;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::app::state::AppState;
use crate::config::application::ApplicationConfig;
use crate::config::piped::PlatformProvider;
use crate::deploysource::{decrypt_secrets, SecretDecrypter};
use crate::errors::PipedError;
use crate::git::Repo;
use crate::model::{Application, ApplicationGitPath, ApplicationKind, ApplicationSyncState, ApplicationSyncStatus};
use crate::utils::now_unix;

/// Outcome of comparing one application with its live state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    None,
    Detected { short_reason: String, details: String },
}

impl Drift {
    /// Sync state to report for an application whose head is `commit`
    pub fn into_sync_state(self, commit: &str) -> ApplicationSyncState {
        match self {
            Drift::None => ApplicationSyncState {
                status: ApplicationSyncStatus::Synced,
                short_reason: String::new(),
                reason: String::new(),
                head_deployment_id: String::new(),
                timestamp: now_unix(),
            },
            Drift::Detected { short_reason, details } => ApplicationSyncState {
                status: ApplicationSyncStatus::OutOfSync,
                short_reason,
                reason: format!(
                    "Diff between the defined state in Git at commit {} and actual live state:\n\n{}",
                    short_commit(commit),
                    details
                ),
                head_deployment_id: String::new(),
                timestamp: now_unix(),
            },
        }
    }
}

fn short_commit(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}

/// Application files at the head commit of a cached clone
pub struct HeadSource<'a> {
    repo: &'a dyn Repo,
    git_path: &'a ApplicationGitPath,
    kind: ApplicationKind,
    pub commit: &'a str,
    work_dir: &'a Path,
    decrypter: Option<&'a Arc<dyn SecretDecrypter>>,
}

/// A loaded [`HeadSource`]. A copied repository is removed on drop.
pub struct LoadedSource {
    pub app_dir: PathBuf,
    pub config: ApplicationConfig,
    _copy: Option<tempfile::TempDir>,
}

impl HeadSource<'_> {
    /// Load the application configuration. The repository is copied first when
    /// secrets have to be decrypted or the caller needs to write, so the
    /// cached clone stays untouched.
    pub async fn load(&self, writable: bool) -> Result<LoadedSource, PipedError> {
        let config_path = self.repo.path().join(self.git_path.config_file_path());
        let config = ApplicationConfig::load_for(&config_path, self.kind).await?;

        let encryption = config.generic.encryption.as_ref().zip(self.decrypter);
        if !writable && encryption.is_none() {
            return Ok(LoadedSource {
                app_dir: self.repo.path().join(&self.git_path.path),
                config,
                _copy: None,
            });
        }

        tokio::fs::create_dir_all(self.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("drift-")
            .tempdir_in(self.work_dir)?;
        let copy = self.repo.copy(&dir.path().join("repo")).await?;
        let app_dir = copy.path().join(&self.git_path.path);
        if let Some((encryption, decrypter)) = encryption {
            decrypt_secrets(&app_dir, encryption, decrypter.as_ref())
                .await
                .map_err(|e| PipedError::Internal(format!("failed to decrypt secrets ({})", e)))?;
        }
        Ok(LoadedSource {
            app_dir,
            config,
            _copy: Some(dir),
        })
    }
}

/// Compares the declared state of one kind of application with the live state
#[async_trait]
pub trait StateChecker: Send + Sync {
    async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError>;
}

/// Checker for the applications of `provider`, `None` when the kind has no live state to compare
pub fn checker_for(state: Arc<AppState>, provider: PlatformProvider) -> Option<Box<dyn StateChecker>> {
    match provider.kind() {
        ApplicationKind::Kubernetes => Some(Box::new(kubernetes::Checker::new(state, provider))),
        ApplicationKind::CloudRun => Some(Box::new(cloudrun::Checker::new(state, provider))),
        ApplicationKind::Ecs => Some(Box::new(ecs::Checker::new(state, provider))),
        ApplicationKind::Terraform if terraform::enabled(&provider) => {
            Some(Box::new(terraform::Checker::new(state, provider)))
        }
        ApplicationKind::Terraform => None,
        ApplicationKind::Lambda => None,
    }
}

pub struct Detector {
    state: Arc<AppState>,
    provider: PlatformProvider,
    checker: Box<dyn StateChecker>,
    work_dir: PathBuf,
    /// Clones kept across passes, keyed by repository id
    repos: tokio::sync::Mutex<HashMap<String, Arc<dyn Repo>>>,
}

impl Detector {
    pub fn new(state: Arc<AppState>, provider: PlatformProvider, checker: Box<dyn StateChecker>) -> Self {
        let work_dir = state.piped.working_dir.join("drift-detector").join(&provider.name);
        Self {
            state,
            provider,
            checker,
            work_dir,
            repos: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider.name
    }

    /// Applications bound to the provider, grouped by repository id
    async fn grouped_applications(&self) -> Result<BTreeMap<String, Vec<Application>>, PipedError> {
        let kind = self.provider.kind();
        let mut grouped: BTreeMap<String, Vec<Application>> = BTreeMap::new();
        for app in self.state.api.list_applications().await? {
            if app.disabled || app.kind != kind || app.platform_provider != self.provider.name {
                continue;
            }
            grouped.entry(app.git_path.repo.id.clone()).or_default().push(app);
        }
        Ok(grouped)
    }

    /// Cached clone of `repo_id`, pulled to the head of its branch
    async fn repository(&self, repo_id: &str) -> Result<Arc<dyn Repo>, PipedError> {
        let mut repos = self.repos.lock().await;
        if let Some(repo) = repos.get(repo_id) {
            let repo = repo.clone();
            repo.pull(repo.cloned_branch()).await?;
            return Ok(repo);
        }

        let cfg = self.state.piped.repository(repo_id).ok_or_else(|| {
            PipedError::Config(format!("repository {} was not found in piped configuration", repo_id))
        })?;
        let dest = self.work_dir.join("repos").join(repo_id);
        if tokio::fs::try_exists(&dest).await? {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let repo: Arc<dyn Repo> = Arc::from(
            self.state
                .git_client
                .clone_repo(&cfg.id, &cfg.remote, &cfg.branch, &dest)
                .await?,
        );
        repos.insert(repo_id.to_string(), repo.clone());
        Ok(repo)
    }

    /// One detection pass over every application of the provider
    pub async fn check_once(&self) -> Result<(), PipedError> {
        for (repo_id, apps) in self.grouped_applications().await? {
            let repo = match self.repository(&repo_id).await {
                Ok(repo) => repo,
                Err(e) => {
                    error!("Failed to update repository {}: {}", repo_id, e);
                    continue;
                }
            };
            let head = match repo.latest_commit().await {
                Ok(commit) => commit,
                Err(e) => {
                    error!("Failed to get the head commit of repository {}: {}", repo_id, e);
                    continue;
                }
            };

            for app in &apps {
                let source = HeadSource {
                    repo: repo.as_ref(),
                    git_path: &app.git_path,
                    kind: app.kind,
                    commit: &head.hash,
                    work_dir: &self.work_dir,
                    decrypter: self.state.decrypter.as_ref(),
                };
                let drift = match self.checker.check(app, &source).await {
                    Ok(drift) => drift,
                    Err(e) => {
                        warn!("Failed to check application {}: {}", app.id, e);
                        continue;
                    }
                };
                debug!("Application {} at commit {}: {:?}", app.id, head.hash, drift);
                let state = drift.into_sync_state(&head.hash);
                if let Err(e) = self.state.api.report_application_sync_state(&app.id, &state).await {
                    error!("Failed to report the sync state of application {}: {}", app.id, e);
                }
            }
        }
        Ok(())
    }
}

/// Detectors for every platform provider whose kind supports drift detection
pub fn detectors(state: &Arc<AppState>) -> Vec<Detector> {
    let mut out = Vec::new();
    for provider in &state.piped.platform_providers {
        match checker_for(state.clone(), provider.clone()) {
            Some(checker) => out.push(Detector::new(state.clone(), provider.clone(), checker)),
            None => info!(
                "Drift detection is disabled for platform provider {} ({})",
                provider.name,
                provider.kind()
            ),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::git::testing::DirGitClient;
    use crate::http::InMemoryApi;

    pub fn application(id: &str, kind: ApplicationKind, provider: &str) -> Application {
        Application {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            git_path: ApplicationGitPath {
                repo: crate::model::ApplicationRepo {
                    id: "repo-1".to_string(),
                    ..Default::default()
                },
                path: "app".to_string(),
                ..Default::default()
            },
            platform_provider: provider.to_string(),
            ..Default::default()
        }
    }

    /// State whose only platform provider is `provider_yaml`
    pub async fn state_with_provider(
        dir: &Path,
        git: DirGitClient,
        provider_yaml: &str,
    ) -> (AppState, Arc<InMemoryApi>) {
        let (mut state, api) = crate::app::state::testing::state(dir, git).await;
        let provider: crate::config::piped::PlatformProvider = serde_yaml::from_str(provider_yaml).unwrap();
        let mut piped = (*state.piped).clone();
        piped.platform_providers = vec![provider];
        state.piped = Arc::new(piped);
        (state, api)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::application;
    use super::*;
    use crate::git::testing::DirGitClient;
    use crate::planner::testing::write_app;

    /// Reports drift for the applications listed in `drifted`
    struct FakeChecker {
        drifted: Vec<String>,
        checked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StateChecker for FakeChecker {
        async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError> {
            let loaded = head.load(false).await?;
            assert!(loaded.app_dir.ends_with("app"));
            self.checked.lock().unwrap().push(app.id.clone());
            if self.drifted.contains(&app.id) {
                return Ok(Drift::Detected {
                    short_reason: "1 resource differs".to_string(),
                    details: "details".to_string(),
                });
            }
            Ok(Drift::None)
        }
    }

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: CloudRunApp\nspec: {}\n";
    const PROVIDER: &str = "name: run\ntype: CLOUDRUN\nconfig:\n  project: demo\n  region: asia-northeast1\n";

    #[test]
    fn test_sync_state() {
        let state = Drift::None.into_sync_state("0123456789abcdef");
        assert_eq!(state.status, ApplicationSyncStatus::Synced);
        assert!(state.reason.is_empty());

        let state = Drift::Detected {
            short_reason: "short".to_string(),
            details: "+ a\n".to_string(),
        }
        .into_sync_state("0123456789abcdef");
        assert_eq!(state.status, ApplicationSyncStatus::OutOfSync);
        assert_eq!(state.short_reason, "short");
        assert!(state.reason.starts_with("Diff between the defined state in Git at commit 0123456 "));
        assert!(state.reason.ends_with("+ a\n"));
    }

    #[tokio::test]
    async fn test_check_once_reports_every_application() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_app(&repo, &[("app.pipecd.yaml", APP)]).await;
        let git = DirGitClient {
            src: repo,
            ..Default::default()
        };
        let clones = git.clones.clone();
        let (state, api) = testing::state_with_provider(dir.path(), git, PROVIDER).await;
        api.add_application(application("app-1", ApplicationKind::CloudRun, "run")).unwrap();
        api.add_application(application("app-2", ApplicationKind::CloudRun, "run")).unwrap();
        // bound to another provider
        api.add_application(application("app-3", ApplicationKind::CloudRun, "other")).unwrap();

        let checker = FakeChecker {
            drifted: vec!["app-2".to_string()],
            checked: Mutex::new(Vec::new()),
        };
        let state = Arc::new(state);
        let provider = state.piped.platform_providers[0].clone();
        let detector = Detector::new(state, provider, Box::new(checker));

        detector.check_once().await.unwrap();
        detector.check_once().await.unwrap();

        assert_eq!(api.sync_state("app-1").unwrap().status, ApplicationSyncStatus::Synced);
        assert_eq!(api.sync_state("app-2").unwrap().status, ApplicationSyncStatus::OutOfSync);
        assert!(api.sync_state("app-3").is_none());
        // the clone is reused by the second pass
        assert_eq!(clones.lock().unwrap().as_slice(), ["repo-1"]);
    }

    #[tokio::test]
    async fn test_lambda_has_no_checker() {
        let dir = tempfile::tempdir().unwrap();
        let lambda = "name: fn\ntype: LAMBDA\nconfig:\n  region: us-east-1\n";
        let (state, _) = testing::state_with_provider(dir.path(), DirGitClient::default(), lambda).await;
        assert!(detectors(&Arc::new(state)).is_empty());
    }
}
