//! Deploy sources: the application directory materialized at one revision
//!
//! A [`DeploySourceProvider`] prepares its source at most once. The read-only
//! view is shared by every caller, [`Provider::get`] hands out a private
//! `cp -rf` snapshot (`repo-1`, `repo-2`, ...) that the caller may modify.

pub mod processor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::application::ApplicationConfig;
use crate::config::piped::PipedRepository;
use crate::errors::PipedError;
use crate::git::{copy_dir, GitClient, Repo};
use crate::logs::StageLogWriter;
use crate::model::{ApplicationGitPath, ApplicationKind};

pub use processor::{attach, decrypt_secrets, Processing, SecretDecrypter};

/// Application directory at a given revision
#[derive(Debug, Clone)]
pub struct DeploySource {
    pub repo_dir: PathBuf,
    pub app_dir: PathBuf,
    /// Human name of the revision, e.g. "target" or "running"
    pub revision_name: String,
    pub revision: String,
    pub config: Arc<ApplicationConfig>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn revision(&self) -> &str;

    /// A private, writable copy of the source
    async fn get(&self, lw: &dyn StageLogWriter) -> Result<DeploySource, PipedError>;

    /// The shared source, callers must not modify it
    async fn get_readonly(&self, lw: &dyn StageLogWriter) -> Result<Arc<DeploySource>, PipedError>;
}

/// Places the repository at the requested revision into `dest`
#[async_trait]
pub trait SourceCloner: Send + Sync {
    async fn clone_to(&self, dest: &Path) -> Result<(), PipedError>;

    fn revision(&self) -> &str;

    fn revision_name(&self) -> &str;
}

/// Clones from the remote repository then checks the revision out
pub struct GitSourceCloner {
    git_client: Arc<dyn GitClient>,
    repo: PipedRepository,
    revision_name: String,
    revision: String,
}

impl GitSourceCloner {
    pub fn new(
        git_client: Arc<dyn GitClient>,
        repo: PipedRepository,
        revision_name: &str,
        revision: &str,
    ) -> Self {
        Self {
            git_client,
            repo,
            revision_name: revision_name.to_string(),
            revision: revision.to_string(),
        }
    }
}

#[async_trait]
impl SourceCloner for GitSourceCloner {
    async fn clone_to(&self, dest: &Path) -> Result<(), PipedError> {
        let repo = self
            .git_client
            .clone_repo(&self.repo.id, &self.repo.remote, &self.repo.branch, dest)
            .await?;
        repo.checkout(&self.revision).await
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn revision_name(&self) -> &str {
        &self.revision_name
    }
}

/// Copies an already cloned repository then checks the revision out
pub struct LocalSourceCloner {
    repo: Arc<dyn Repo>,
    revision_name: String,
    revision: String,
}

impl LocalSourceCloner {
    pub fn new(repo: Arc<dyn Repo>, revision_name: &str, revision: &str) -> Self {
        Self {
            repo,
            revision_name: revision_name.to_string(),
            revision: revision.to_string(),
        }
    }
}

#[async_trait]
impl SourceCloner for LocalSourceCloner {
    async fn clone_to(&self, dest: &Path) -> Result<(), PipedError> {
        let copied = self.repo.copy(dest).await?;
        copied.checkout(&self.revision).await
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn revision_name(&self) -> &str {
        &self.revision_name
    }
}

#[derive(Default)]
struct ProviderState {
    prepared: Option<Result<Arc<DeploySource>, PipedError>>,
    copy_num: u32,
}

pub struct DeploySourceProvider {
    working_dir: PathBuf,
    cloner: Box<dyn SourceCloner>,
    git_path: ApplicationGitPath,
    kind: ApplicationKind,
    decrypter: Option<Arc<dyn SecretDecrypter>>,
    state: Mutex<ProviderState>,
}

impl DeploySourceProvider {
    pub fn new(
        working_dir: &Path,
        cloner: Box<dyn SourceCloner>,
        git_path: ApplicationGitPath,
        kind: ApplicationKind,
        decrypter: Option<Arc<dyn SecretDecrypter>>,
    ) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            cloner,
            git_path,
            kind,
            decrypter,
            state: Mutex::new(ProviderState::default()),
        }
    }

    async fn ensure_prepared(
        &self,
        lw: &dyn StageLogWriter,
    ) -> Result<(Arc<DeploySource>, tokio::sync::MutexGuard<'_, ProviderState>), PipedError> {
        let mut state = self.state.lock().await;
        if state.prepared.is_none() {
            let result = self.prepare(lw).await.map(Arc::new);
            state.prepared = Some(result);
        }
        let source = match &state.prepared {
            Some(Ok(source)) => source.clone(),
            Some(Err(e)) => return Err(e.replicate()),
            None => return Err(PipedError::Internal("deploy source was not prepared".to_string())),
        };
        Ok((source, state))
    }

    async fn prepare(&self, lw: &dyn StageLogWriter) -> Result<DeploySource, PipedError> {
        let revision_name = self.cloner.revision_name();
        let revision = self.cloner.revision();

        if let Err(e) = tokio::fs::create_dir_all(&self.working_dir).await {
            lw.error(&format!(
                "Unable to create the working directory to store deploy source ({})",
                e
            ));
            return Err(e.into());
        }

        let dir = tempfile::Builder::new()
            .prefix("deploysource-")
            .tempdir_in(&self.working_dir)
            .map_err(|e| {
                lw.error(&format!(
                    "Unable to create a temp directory to store the deploy source ({})",
                    e
                ));
                PipedError::from(e)
            })?
            .keep();

        let repo_dir = dir.join("repo");
        let app_dir = repo_dir.join(&self.git_path.path);

        if let Err(e) = self.cloner.clone_to(&repo_dir).await {
            lw.error(&format!(
                "Unable to clone the {} commit {} of the repository ({})",
                revision_name, revision, e
            ));
            return Err(e);
        }
        lw.info(&format!(
            "Successfully cloned the {} commit {} of the repository {}",
            revision_name, revision, self.git_path.repo.id
        ));

        let config_path = repo_dir.join(self.git_path.config_file_path());
        let config = match ApplicationConfig::load_for(&config_path, self.kind).await {
            Ok(config) => config,
            Err(e) => {
                lw.error(&format!(
                    "Unable to load the application configuration file at {} ({})",
                    self.git_path.config_file_path(),
                    e
                ));
                return Err(e);
            }
        };
        lw.info("Successfully loaded the application configuration file");

        let encryption = config.generic.encryption.as_ref();
        let attachment = config.generic.attachment.as_ref();
        let processing = Processing::of(encryption, attachment);

        if matches!(processing, Processing::SecretOnly | Processing::Both) {
            if let (Some(encryption), Some(decrypter)) = (encryption, &self.decrypter) {
                if let Err(e) = decrypt_secrets(&app_dir, encryption, decrypter.as_ref()).await {
                    lw.error(&format!("Unable to decrypt the secrets ({})", e));
                    return Err(e);
                }
                lw.info(&format!(
                    "Successfully decrypted secrets: {:?}",
                    encryption.decryption_targets
                ));
            }
        }
        if matches!(processing, Processing::AttachmentOnly | Processing::Both) {
            if let Some(attachment) = attachment {
                if let Err(e) = attach(&app_dir, attachment).await {
                    lw.error(&format!("Unable to attach files ({})", e));
                    return Err(e);
                }
                lw.info(&format!(
                    "Successfully attached files to {:?}",
                    attachment.targets
                ));
            }
        }

        Ok(DeploySource {
            repo_dir,
            app_dir,
            revision_name: revision_name.to_string(),
            revision: revision.to_string(),
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl Provider for DeploySourceProvider {
    fn revision(&self) -> &str {
        self.cloner.revision()
    }

    async fn get(&self, lw: &dyn StageLogWriter) -> Result<DeploySource, PipedError> {
        lw.info(&format!(
            "Preparing deploy source at {} commit ({})",
            self.cloner.revision_name(),
            self.cloner.revision()
        ));

        let (source, mut state) = self.ensure_prepared(lw).await?;
        state.copy_num += 1;
        let dest = PathBuf::from(format!("{}-{}", source.repo_dir.display(), state.copy_num));
        drop(state);

        if let Err(e) = copy_dir(&source.repo_dir, &dest).await {
            lw.error(&format!("Unable to copy deploy source data ({})", e));
            return Err(e);
        }

        lw.info(&format!(
            "Successfully prepared deploy source at {} commit ({})",
            self.cloner.revision_name(),
            self.cloner.revision()
        ));
        Ok(DeploySource {
            app_dir: dest.join(&self.git_path.path),
            repo_dir: dest,
            revision_name: source.revision_name.clone(),
            revision: source.revision.clone(),
            config: source.config.clone(),
        })
    }

    async fn get_readonly(&self, lw: &dyn StageLogWriter) -> Result<Arc<DeploySource>, PipedError> {
        lw.info(&format!(
            "Preparing deploy source at {} commit ({})",
            self.cloner.revision_name(),
            self.cloner.revision()
        ));

        let (source, _state) = self.ensure_prepared(lw).await?;

        lw.info(&format!(
            "Successfully prepared deploy source at {} commit ({})",
            self.cloner.revision_name(),
            self.cloner.revision()
        ));
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::logs::TracingLogWriter;
    use crate::model::ApplicationRepo;

    const APP_CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: CloudRunApp
spec:
  name: hello
"#;

    struct FakeCloner {
        calls: Arc<AtomicUsize>,
        config: &'static str,
    }

    #[async_trait]
    impl SourceCloner for FakeCloner {
        async fn clone_to(&self, dest: &Path) -> Result<(), PipedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let app_dir = dest.join("apps/hello");
            tokio::fs::create_dir_all(&app_dir).await?;
            tokio::fs::write(app_dir.join("app.pipecd.yaml"), self.config).await?;
            tokio::fs::write(app_dir.join("service.yaml"), "kind: Service").await?;
            Ok(())
        }

        fn revision(&self) -> &str {
            "abc1234"
        }

        fn revision_name(&self) -> &str {
            "target"
        }
    }

    fn git_path() -> ApplicationGitPath {
        ApplicationGitPath {
            repo: ApplicationRepo {
                id: "repo-1".to_string(),
                remote: String::new(),
                branch: "main".to_string(),
            },
            path: "apps/hello".to_string(),
            config_filename: String::new(),
            url: String::new(),
        }
    }

    fn provider(dir: &Path, calls: Arc<AtomicUsize>, config: &'static str) -> DeploySourceProvider {
        DeploySourceProvider::new(
            dir,
            Box::new(FakeCloner { calls, config }),
            git_path(),
            ApplicationKind::CloudRun,
            None,
        )
    }

    #[tokio::test]
    async fn test_prepares_once_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = provider(dir.path(), calls.clone(), APP_CONFIG);
        let lw = TracingLogWriter::new("test");

        let ro1 = p.get_readonly(&lw).await.unwrap();
        let ro2 = p.get_readonly(&lw).await.unwrap();
        assert!(Arc::ptr_eq(&ro1, &ro2));
        assert_eq!(ro1.config.generic.name, "hello");

        let w1 = p.get(&lw).await.unwrap();
        let w2 = p.get(&lw).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(w1.repo_dir.to_string_lossy().ends_with("repo-1"));
        assert!(w2.repo_dir.to_string_lossy().ends_with("repo-2"));
        assert!(w1.app_dir.join("service.yaml").exists());

        std::fs::write(w1.app_dir.join("service.yaml"), "changed").unwrap();
        let original = std::fs::read_to_string(ro1.app_dir.join("service.yaml")).unwrap();
        assert_eq!(original, "kind: Service");
    }

    #[tokio::test]
    async fn test_caches_failure() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = provider(
            dir.path(),
            calls.clone(),
            "apiVersion: pipecd.dev/v1beta1\nkind: LambdaApp\nspec: {}\n",
        );
        let lw = TracingLogWriter::new("test");

        assert!(matches!(p.get_readonly(&lw).await, Err(PipedError::Config(_))));
        assert!(matches!(p.get(&lw).await, Err(PipedError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
