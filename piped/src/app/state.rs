//! Application state management

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::AppManifestsCache;
use crate::config::piped::PipedSpec;
use crate::deploysource::{DeploySourceProvider, GitSourceCloner, Provider, SecretDecrypter};
use crate::errors::PipedError;
use crate::executor;
use crate::git::GitClient;
use crate::http::PipedApi;
use crate::model::{ApplicationGitPath, ApplicationKind};
use crate::planner;
use crate::platformprovider::kubernetes::Manifest;
use crate::platformprovider::PlatformClients;
use crate::regexpool::{default_pool, RegexPool};
use crate::toolregistry::ToolRegistry;

/// Capacity of the per-commit manifests cache
pub const MANIFESTS_CACHE_CAPACITY: u64 = 256;

/// Components shared by every worker of piped
pub struct AppState {
    pub piped: Arc<PipedSpec>,

    /// Control-plane client
    pub api: Arc<dyn PipedApi>,

    pub git_client: Arc<dyn GitClient>,

    /// Cloud clients and installed tools, created on first use per platform provider
    pub clients: Arc<PlatformClients>,

    pub executors: Arc<executor::Registry>,
    pub planners: Arc<planner::Registry>,

    /// Kubernetes manifests loaded per `(application, commit)`
    pub manifests_cache: Arc<AppManifestsCache<Vec<Manifest>>>,

    pub regex_pool: &'static RegexPool,

    pub decrypter: Option<Arc<dyn SecretDecrypter>>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(
        piped: PipedSpec,
        api: Arc<dyn PipedApi>,
        git_client: Arc<dyn GitClient>,
    ) -> Result<Self, PipedError> {
        info!("Initializing application state...");

        tokio::fs::create_dir_all(&piped.working_dir).await?;
        let tools = Arc::new(ToolRegistry::new(&piped.tools_dir).await?);
        let clients = Arc::new(PlatformClients::new(tools));
        Self::new(piped, api, git_client, clients)
    }

    pub fn new(
        piped: PipedSpec,
        api: Arc<dyn PipedApi>,
        git_client: Arc<dyn GitClient>,
        clients: Arc<PlatformClients>,
    ) -> Result<Self, PipedError> {
        Ok(Self {
            piped: Arc::new(piped),
            api,
            git_client,
            clients,
            executors: Arc::new(executor::Registry::with_defaults()?),
            planners: Arc::new(planner::Registry::with_defaults()?),
            manifests_cache: Arc::new(AppManifestsCache::new(MANIFESTS_CACHE_CAPACITY)),
            regex_pool: default_pool(),
            decrypter: None,
        })
    }

    /// Deploy source of `revision` cloned from the repository the application lives in
    pub fn source_provider(
        &self,
        working_dir: &Path,
        git_path: &ApplicationGitPath,
        kind: ApplicationKind,
        revision_name: &str,
        revision: &str,
    ) -> Result<Arc<dyn Provider>, PipedError> {
        let repo = self.piped.repository(&git_path.repo.id).ok_or_else(|| {
            PipedError::Config(format!(
                "repository {} was not registered in the piped configuration",
                git_path.repo.id
            ))
        })?;
        let cloner = GitSourceCloner::new(self.git_client.clone(), repo.clone(), revision_name, revision);
        Ok(Arc::new(DeploySourceProvider::new(
            working_dir,
            Box::new(cloner),
            git_path.clone(),
            kind,
            self.decrypter.clone(),
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::piped::PipedConfig;
    use crate::git::testing::DirGitClient;
    use crate::http::InMemoryApi;

    pub const PIPED_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  pipedID: piped-1
  apiAddress: http://localhost:8080
  repositories:
    - repoId: repo-1
      remote: git@github.com:demo/manifests.git
      branch: main
"#;

    /// State backed by the in-memory control plane and a directory "repository"
    pub async fn state(work_dir: &Path, git: DirGitClient) -> (AppState, Arc<InMemoryApi>) {
        let mut piped = PipedConfig::parse(PIPED_CONFIG).unwrap().spec;
        piped.working_dir = work_dir.join("work");
        piped.tools_dir = work_dir.join("tools");
        let api = Arc::new(InMemoryApi::new());
        let tools = Arc::new(ToolRegistry::new(&piped.tools_dir).await.unwrap());
        let state = AppState::new(
            piped,
            api.clone(),
            Arc::new(git),
            Arc::new(PlatformClients::new(tools)),
        )
        .unwrap();
        (state, api)
    }
}
