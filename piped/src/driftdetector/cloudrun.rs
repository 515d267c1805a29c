use std::sync::Arc;

use async_trait::async_trait;

use super::{Drift, HeadSource, StateChecker};
use crate::app::state::AppState;
use crate::cache::AppManifestsCache;
use crate::config::piped::PlatformProvider;
use crate::diff::Renderer;
use crate::errors::PipedError;
use crate::model::Application;
use crate::platformprovider::cloudrun::{diff_service, ServiceManifest};

const CACHE_CAPACITY: u64 = 256;

pub struct Checker {
    state: Arc<AppState>,
    provider: PlatformProvider,
    manifests: AppManifestsCache<ServiceManifest>,
}

impl Checker {
    pub fn new(state: Arc<AppState>, provider: PlatformProvider) -> Self {
        Self {
            state,
            provider,
            manifests: AppManifestsCache::new(CACHE_CAPACITY),
        }
    }

    async fn head_manifest(&self, app: &Application, head: &HeadSource<'_>) -> Result<Arc<ServiceManifest>, PipedError> {
        if let Some(sm) = self.manifests.get(&app.id, head.commit) {
            return Ok(sm);
        }
        let source = head.load(false).await?;
        let spec = source.config.cloudrun_spec().ok_or_else(|| {
            PipedError::Config("missing CloudRunApplicationSpec in application configuration".to_string())
        })?;
        let sm = ServiceManifest::load(&source.app_dir, &spec.input.service_manifest_file).await?;
        Ok(self.manifests.put(&app.id, head.commit, sm))
    }
}

#[async_trait]
impl StateChecker for Checker {
    async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError> {
        let declared = self.head_manifest(app, head).await?;
        let client = self.state.clients.cloudrun(&self.provider).await?;
        let live = client.get_service(&declared.name).await?;

        let result = diff_service(&declared, &live);
        if result.no_change() {
            return Ok(Drift::None);
        }
        Ok(Drift::Detected {
            short_reason: "The service manifest is not synced".to_string(),
            details: format!(
                "--- Git\n+++ Live\n\n{}",
                Renderer::new().with_left_padding(1).render(result.nodes())
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driftdetector::testing::{application, state_with_provider};
    use crate::git::testing::{DirGitClient, DirRepo};
    use crate::model::ApplicationKind;
    use crate::planner::testing::write_app;
    use crate::platformprovider::cloudrun::{Client, Revision};

    struct LiveService(ServiceManifest);

    #[async_trait]
    impl Client for LiveService {
        async fn create(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
            Ok(sm.clone())
        }

        async fn update(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
            Ok(sm.clone())
        }

        async fn get_service(&self, name: &str) -> Result<ServiceManifest, PipedError> {
            if name == self.0.name {
                return Ok(self.0.clone());
            }
            Err(PipedError::NotFound(name.to_string()))
        }

        async fn list_services(&self, _selector: &str) -> Result<Vec<ServiceManifest>, PipedError> {
            Ok(vec![self.0.clone()])
        }

        async fn get_revision(&self, name: &str) -> Result<Revision, PipedError> {
            Err(PipedError::NotFound(name.to_string()))
        }

        async fn list_revisions(&self, _selector: &str) -> Result<Vec<Revision>, PipedError> {
            Ok(Vec::new())
        }
    }

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: CloudRunApp\nspec: {}\n";
    const SERVICE: &str = r#"
apiVersion: serving.knative.dev/v1
kind: Service
metadata:
  name: helloworld
spec:
  template:
    spec:
      containers:
        - image: gcr.io/demo/helloworld:v0.1.0
"#;
    const PROVIDER: &str = "name: run\ntype: CLOUDRUN\nconfig:\n  project: demo\n  region: asia-northeast1\n";

    async fn check(live: &str) -> Drift {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        write_app(&repo_dir, &[("app.pipecd.yaml", APP), ("service.yaml", SERVICE)]).await;
        let (state, _) = state_with_provider(dir.path(), DirGitClient::default(), PROVIDER).await;
        let live = LiveService(ServiceManifest::parse(live).unwrap());
        state.clients.cloudrun.insert("run", Arc::new(live)).unwrap();
        let provider = state.piped.platform_providers[0].clone();
        let checker = Checker::new(Arc::new(state), provider);

        let app = application("app-1", ApplicationKind::CloudRun, "run");
        let repo = DirRepo {
            dir: repo_dir,
            branch: "main".to_string(),
            changed: Vec::new(),
            conflicting_branch: None,
        };
        let head = HeadSource {
            repo: &repo,
            git_path: &app.git_path,
            kind: app.kind,
            commit: "0123456789abcdef",
            work_dir: &dir.path().join("drift"),
            decrypter: None,
        };
        let drift = checker.check(&app, &head).await.unwrap();
        assert!(checker.manifests.get("app-1", "0123456789abcdef").is_some());
        drift
    }

    #[tokio::test]
    async fn test_status_and_defaults_are_ignored() {
        let live = format!("{}  traffic:\n    - percent: 100\n      latestRevision: true\nstatus:\n  url: https://example.com\n", SERVICE);
        assert_eq!(check(&live).await, Drift::None);
    }

    #[tokio::test]
    async fn test_image_change_is_out_of_sync() {
        let live = SERVICE.replace("v0.1.0", "v0.2.0");
        let Drift::Detected { short_reason, details } = check(&live).await else {
            panic!("expected a drift");
        };
        assert_eq!(short_reason, "The service manifest is not synced");
        assert!(details.contains("v0.2.0"));
    }
}
