use std::sync::Arc;

use async_trait::async_trait;

use super::{Drift, HeadSource, StateChecker};
use crate::app::state::AppState;
use crate::cache::AppManifestsCache;
use crate::config::piped::PlatformProvider;
use crate::diff::Renderer;
use crate::errors::PipedError;
use crate::model::Application;
use crate::platformprovider::ecs::{diff_definitions, live_definitions, Definitions};

const CACHE_CAPACITY: u64 = 256;

pub struct Checker {
    state: Arc<AppState>,
    provider: PlatformProvider,
    definitions: AppManifestsCache<Definitions>,
}

impl Checker {
    pub fn new(state: Arc<AppState>, provider: PlatformProvider) -> Self {
        Self {
            state,
            provider,
            definitions: AppManifestsCache::new(CACHE_CAPACITY),
        }
    }

    async fn head_definitions(&self, app: &Application, head: &HeadSource<'_>) -> Result<Arc<Definitions>, PipedError> {
        if let Some(defs) = self.definitions.get(&app.id, head.commit) {
            return Ok(defs);
        }
        let source = head.load(false).await?;
        let spec = source.config.ecs_spec().ok_or_else(|| {
            PipedError::Config("missing ECSApplicationSpec in application configuration".to_string())
        })?;
        let defs = Definitions::load(&source.app_dir, &spec.input).await?;
        Ok(self.definitions.put(&app.id, head.commit, defs))
    }
}

#[async_trait]
impl StateChecker for Checker {
    async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError> {
        let declared = self.head_definitions(app, head).await?;
        let client = self.state.clients.ecs(&self.provider).await?;
        let live = live_definitions(client.as_ref(), &declared).await?;

        let (task, service) = diff_definitions(&declared, &live);
        if task.no_change() && service.no_change() {
            return Ok(Drift::None);
        }

        let renderer = Renderer::new().with_left_padding(1);
        let mut details = String::from("--- Git\n+++ Live\n\n");
        let mut drifted = Vec::new();
        if task.has_diff() {
            drifted.push("task definition");
            details.push_str(&format!("# Task definition {}\n\n", declared.task.family()));
            details.push_str(&renderer.render(task.nodes()));
            details.push('\n');
        }
        if service.has_diff() {
            drifted.push("service definition");
            details.push_str(&format!("# Service {}\n\n", declared.service.service_name()));
            details.push_str(&renderer.render(service.nodes()));
            details.push('\n');
        }
        Ok(Drift::Detected {
            short_reason: format!("The {} is not synced", drifted.join(" and ")),
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::driftdetector::testing::{application, state_with_provider};
    use crate::git::testing::{DirGitClient, DirRepo};
    use crate::model::ApplicationKind;
    use crate::planner::testing::write_app;
    use crate::platformprovider::ecs::{Client, ServiceDefinition, TaskDefinition};

    struct LiveService {
        desired_count: u32,
    }

    #[async_trait]
    impl Client for LiveService {
        async fn register_task_definition(&self, _td: &TaskDefinition) -> Result<String, PipedError> {
            Ok("arn:aws:ecs:td/web:1".to_string())
        }

        async fn service_exists(&self, _cluster: &str, _name: &str) -> Result<bool, PipedError> {
            Ok(true)
        }

        async fn create_service(&self, _sd: &ServiceDefinition, _arn: &str) -> Result<(), PipedError> {
            Ok(())
        }

        async fn update_service(&self, _sd: &ServiceDefinition, _arn: &str) -> Result<(), PipedError> {
            Ok(())
        }

        async fn describe_service(&self, _cluster: &str, _name: &str) -> Result<ServiceDefinition, PipedError> {
            ServiceDefinition::from_value(json!({
                "clusterArn": "arn:aws:ecs:cluster/demo",
                "serviceName": "web",
                "desiredCount": self.desired_count,
                "taskDefinition": "arn:aws:ecs:td/web:1",
            }))
        }

        async fn describe_task_definition(&self, _arn: &str) -> Result<TaskDefinition, PipedError> {
            TaskDefinition::from_value(json!({
                "family": "web",
                "revision": 1,
                "containerDefinitions": [{"name": "web", "image": "nginx:1.25"}],
            }))
        }
    }

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: ECSApp\nspec: {}\n";
    const TASKDEF: &str = "family: web\ncontainerDefinitions:\n  - name: web\n    image: nginx:1.25\n";
    const SERVICEDEF: &str = "cluster: demo\nserviceName: web\ndesiredCount: 2\n";
    const PROVIDER: &str = "name: ecs\ntype: ECS\nconfig:\n  region: us-east-1\n";

    async fn check(desired_count: u32) -> Drift {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        write_app(
            &repo_dir,
            &[("app.pipecd.yaml", APP), ("taskdef.yaml", TASKDEF), ("servicedef.yaml", SERVICEDEF)],
        )
        .await;
        let (state, _) = state_with_provider(dir.path(), DirGitClient::default(), PROVIDER).await;
        state.clients.ecs.insert("ecs", Arc::new(LiveService { desired_count })).unwrap();
        let provider = state.piped.platform_providers[0].clone();
        let checker = Checker::new(Arc::new(state), provider);

        let app = application("app-1", ApplicationKind::Ecs, "ecs");
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
        checker.check(&app, &head).await.unwrap()
    }

    #[tokio::test]
    async fn test_synced_service() {
        assert_eq!(check(2).await, Drift::None);
    }

    #[tokio::test]
    async fn test_scaled_service_is_out_of_sync() {
        let Drift::Detected { short_reason, details } = check(5).await else {
            panic!("expected a drift");
        };
        assert_eq!(short_reason, "The service definition is not synced");
        assert!(details.contains("# Service web"));
        assert!(!details.contains("# Task definition"));
    }
}
