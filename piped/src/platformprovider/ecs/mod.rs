//! Amazon ECS adapter
//!
//! An application is a task definition plus the service running it. A sync
//! registers a new task definition revision and points the service at it.

mod client;
mod definition;

pub use client::{AwsCliClient, Client};
pub use definition::{ServiceDefinition, TaskDefinition};

use tracing::info;

use crate::config::application::EcsDeploymentInput;
use crate::diff::{self, DiffResult, Options};
use crate::errors::PipedError;
use crate::logs::StageLogWriter;
use crate::model::ArtifactVersion;
use crate::platformprovider::builtin_labels;

/// Tag keys may not contain slashes on every AWS service
pub const LABEL_PREFIX: &str = "pipecd-dev-";

/// Task and service definitions of one application
#[derive(Debug, Clone, PartialEq)]
pub struct Definitions {
    pub task: TaskDefinition,
    pub service: ServiceDefinition,
}

impl Definitions {
    pub async fn load(app_dir: &std::path::Path, input: &EcsDeploymentInput) -> Result<Self, PipedError> {
        Ok(Self {
            task: TaskDefinition::load(app_dir, &input.task_definition_file).await?,
            service: ServiceDefinition::load(app_dir, &input.service_definition_file).await?,
        })
    }

    pub fn add_builtin_tags(&mut self, piped_id: &str, app_id: &str, commit: &str) {
        let tags = builtin_labels(LABEL_PREFIX, piped_id, app_id, commit);
        self.task.add_tags(&tags);
        self.service.add_tags(&tags);
    }
}

/// Register the task definition, then update the service running it or create
/// the service when it does not exist yet.
pub async fn sync(client: &dyn Client, defs: &Definitions, lw: &dyn StageLogWriter) -> Result<(), PipedError> {
    lw.info(&format!("Registering a new revision of task definition {}", defs.task.family()));
    let arn = client.register_task_definition(&defs.task).await?;
    lw.info(&format!("Registered task definition {}", arn));

    let cluster = defs.service.cluster();
    let name = defs.service.service_name();
    if client.service_exists(cluster, name).await? {
        lw.info(&format!("Updating service {} to use {}", name, arn));
        client.update_service(&defs.service, &arn).await?;
    } else {
        lw.info(&format!("Service {} does not exist, creating it", name));
        client.create_service(&defs.service, &arn).await?;
    }
    info!("Synced ECS service {} in cluster {}", name, cluster);
    Ok(())
}

pub fn determine_versions(td: &TaskDefinition) -> Vec<ArtifactVersion> {
    let versions = td.artifact_versions();
    if versions.is_empty() {
        vec![ArtifactVersion::unknown()]
    } else {
        versions
    }
}

/// Live definitions: the service plus the task definition it currently runs
pub async fn live_definitions(client: &dyn Client, declared: &Definitions) -> Result<Definitions, PipedError> {
    let service = client
        .describe_service(declared.service.cluster(), declared.service.service_name())
        .await?;
    let arn = service
        .body
        .get("taskDefinition")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    if arn.is_empty() {
        return Err(PipedError::NotFound(format!(
            "service {} runs no task definition",
            declared.service.service_name()
        )));
    }
    let task = client.describe_task_definition(&arn).await?;
    Ok(Definitions { task, service })
}

/// Compare the declared definitions with the live ones. The live service is
/// reported with a `clusterArn` instead of a `cluster`, which is ignored.
pub fn diff_definitions(declared: &Definitions, live: &Definitions) -> (DiffResult, DiffResult) {
    let options = Options::live_state().with_ignored_paths(vec!["cluster".to_string()]);
    let task = diff::diff(&declared.task.body, &live.task.body, &options);
    let service = diff::diff(&declared.service.body, &live.service.body, &options);
    (task, service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        existing: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Client for FakeClient {
        async fn register_task_definition(&self, td: &TaskDefinition) -> Result<String, PipedError> {
            self.calls.lock().unwrap().push(format!("register:{}", td.family()));
            Ok(format!("arn:aws:ecs:td/{}:7", td.family()))
        }

        async fn service_exists(&self, _cluster: &str, _name: &str) -> Result<bool, PipedError> {
            Ok(self.existing)
        }

        async fn create_service(&self, sd: &ServiceDefinition, arn: &str) -> Result<(), PipedError> {
            self.calls.lock().unwrap().push(format!("create:{}:{}", sd.service_name(), arn));
            Ok(())
        }

        async fn update_service(&self, sd: &ServiceDefinition, arn: &str) -> Result<(), PipedError> {
            self.calls.lock().unwrap().push(format!("update:{}:{}", sd.service_name(), arn));
            Ok(())
        }

        async fn describe_service(&self, _cluster: &str, _name: &str) -> Result<ServiceDefinition, PipedError> {
            ServiceDefinition::from_value(json!({
                "clusterArn": "c",
                "serviceName": "web",
                "desiredCount": 2,
                "taskDefinition": "arn:aws:ecs:td/web:7",
                "status": "ACTIVE",
            }))
        }

        async fn describe_task_definition(&self, _arn: &str) -> Result<TaskDefinition, PipedError> {
            TaskDefinition::from_value(json!({
                "family": "web",
                "cpu": "256",
                "revision": 7,
                "containerDefinitions": [{"name": "web", "image": "nginx:1.25"}],
            }))
        }
    }

    fn definitions() -> Definitions {
        Definitions {
            task: TaskDefinition::from_value(json!({
                "family": "web",
                "cpu": 256,
                "containerDefinitions": [{"name": "web", "image": "nginx:1.25"}],
            }))
            .unwrap(),
            service: ServiceDefinition::from_value(json!({
                "cluster": "c",
                "serviceName": "web",
                "desiredCount": 2,
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_sync_creates_missing_service() {
        let client = FakeClient::default();
        let lw = crate::logs::TracingLogWriter::new("test");
        sync(&client, &definitions(), &lw).await.unwrap();
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec!["register:web", "create:web:arn:aws:ecs:td/web:7"]
        );
    }

    #[tokio::test]
    async fn test_sync_updates_existing_service() {
        let client = FakeClient {
            existing: true,
            ..Default::default()
        };
        let lw = crate::logs::TracingLogWriter::new("test");
        sync(&client, &definitions(), &lw).await.unwrap();
        assert_eq!(client.calls.lock().unwrap()[1], "update:web:arn:aws:ecs:td/web:7");
    }

    #[tokio::test]
    async fn test_live_definitions_without_drift() {
        let client = FakeClient::default();
        let declared = definitions();
        let live = live_definitions(&client, &declared).await.unwrap();
        let (task, service) = diff_definitions(&declared, &live);
        assert!(task.no_change());
        assert!(service.no_change());
    }

    #[test]
    fn test_builtin_tags() {
        let mut defs = definitions();
        defs.add_builtin_tags("piped-1", "app-1", "abc");
        let tags = defs.task.body["tags"].as_array().unwrap();
        assert!(tags.contains(&json!({"key": "pipecd-dev-application", "value": "app-1"})));
        assert_eq!(determine_versions(&defs.task)[0].version, "1.25");
    }
}
