//! Planner unit tests driven through the public deploy source API

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use piped::cache::AppManifestsCache;
use piped::deploysource::{DeploySourceProvider, Provider, SourceCloner};
use piped::errors::PipedError;
use piped::model::{
    ApplicationGitPath, ApplicationKind, ApplicationRepo, Commit, Deployment, DeploymentTrigger, StageName,
    SyncStrategy,
};
use piped::planner::{Input, Planner, Registry};
use piped::regexpool::default_pool;

struct DirCloner {
    src: PathBuf,
    revision: String,
}

#[async_trait]
impl SourceCloner for DirCloner {
    async fn clone_to(&self, dest: &Path) -> Result<(), PipedError> {
        piped::git::copy_dir(&self.src, dest).await
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn revision_name(&self) -> &str {
        "target"
    }
}

const NO_PIPELINE: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: web
"#;

const WITH_PIPELINE: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: web
  pipeline:
    stages:
      - name: WAIT_APPROVAL
      - name: K8S_SYNC
"#;

const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: web
          image: gcr.io/demo/web:v1.0.0
"#;

fn deployment() -> Deployment {
    Deployment {
        id: "dep-1".to_string(),
        application_id: "app-1".to_string(),
        kind: ApplicationKind::Kubernetes,
        git_path: ApplicationGitPath {
            repo: ApplicationRepo {
                id: "repo-1".to_string(),
                ..Default::default()
            },
            path: "web".to_string(),
            ..Default::default()
        },
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: "abc123".to_string(),
                message: "bump web".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn write_app(repo: &Path, app_config: &str) {
    tokio::fs::create_dir_all(repo.join("web")).await.unwrap();
    tokio::fs::write(repo.join("web/app.pipecd.yaml"), app_config).await.unwrap();
    tokio::fs::write(repo.join("web/deployment.yaml"), DEPLOYMENT).await.unwrap();
}

fn input(work_dir: &Path, repo: &Path, running_commit: &str) -> Input {
    let deployment = deployment();
    let provider = |dir: &str, revision: &str| -> Arc<dyn Provider> {
        Arc::new(DeploySourceProvider::new(
            &work_dir.join(dir),
            Box::new(DirCloner {
                src: repo.to_path_buf(),
                revision: revision.to_string(),
            }),
            deployment.git_path.clone(),
            ApplicationKind::Kubernetes,
            None,
        ))
    };
    Input {
        target_ds: provider("target", "abc123"),
        running_ds: if running_commit.is_empty() {
            None
        } else {
            Some(provider("running", running_commit))
        },
        most_recent_successful_commit_hash: running_commit.to_string(),
        deployment: Arc::new(deployment),
        manifests_cache: Arc::new(AppManifestsCache::default()),
        regex_pool: default_pool(),
    }
}

#[tokio::test]
async fn test_kubernetes_without_pipeline_is_quick_sync() {
    let work = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    write_app(repo.path(), NO_PIPELINE).await;

    let registry = Registry::with_defaults().unwrap();
    let planner = registry.planner(ApplicationKind::Kubernetes).unwrap();
    let out = planner.plan(&input(work.path(), repo.path(), "old123")).await.unwrap();

    assert_eq!(out.sync_strategy, SyncStrategy::QuickSync);
    assert_eq!(out.summary, "Quick sync by applying all manifests (no pipeline was configured)");
    assert_eq!(out.stages[0].name, StageName::K8sSync);
    assert_eq!(out.version, "v1.0.0");
}

#[tokio::test]
async fn test_kubernetes_first_deployment_skips_the_pipeline() {
    let work = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    write_app(repo.path(), WITH_PIPELINE).await;

    let registry = Registry::with_defaults().unwrap();
    let planner = registry.planner(ApplicationKind::Kubernetes).unwrap();
    let out = planner.plan(&input(work.path(), repo.path(), "")).await.unwrap();

    assert_eq!(out.sync_strategy, SyncStrategy::QuickSync);
    assert_eq!(
        out.summary,
        "Quick sync by applying all manifests because it seems this is the first deployment"
    );
}

#[test]
fn test_registry_rejects_duplicates() {
    let mut registry = Registry::with_defaults().unwrap();
    let planner = registry.planner(ApplicationKind::Ecs).unwrap();
    assert!(matches!(
        registry.register(ApplicationKind::Ecs, planner),
        Err(PipedError::Conflict(_))
    ));
}
