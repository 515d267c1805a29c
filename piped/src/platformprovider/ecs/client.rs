use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::definition::{ServiceDefinition, TaskDefinition};
use crate::config::piped::AwsProviderConfig;
use crate::errors::PipedError;
use crate::platformprovider::aws::AwsCli;

#[async_trait]
pub trait Client: Send + Sync {
    /// Register a new revision of the task definition, returning its ARN
    async fn register_task_definition(&self, td: &TaskDefinition) -> Result<String, PipedError>;

    async fn service_exists(&self, cluster: &str, service_name: &str) -> Result<bool, PipedError>;

    async fn create_service(&self, sd: &ServiceDefinition, task_definition_arn: &str) -> Result<(), PipedError>;

    async fn update_service(&self, sd: &ServiceDefinition, task_definition_arn: &str) -> Result<(), PipedError>;

    /// Live service, `NotFound` when missing or inactive
    async fn describe_service(&self, cluster: &str, service_name: &str) -> Result<ServiceDefinition, PipedError>;

    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinition, PipedError>;
}

/// Client backed by the `aws ecs` CLI
pub struct AwsCliClient {
    cli: AwsCli,
}

impl AwsCliClient {
    pub fn new(config: &AwsProviderConfig) -> Result<Self, PipedError> {
        Ok(Self {
            cli: AwsCli::new(config)?,
        })
    }

    async fn call(&self, operation: &str, input: &Value) -> Result<Value, PipedError> {
        self.cli.call("ecs", operation, Some(input), &[]).await
    }

    async fn describe(&self, cluster: &str, service_name: &str) -> Result<Option<Value>, PipedError> {
        let output = self
            .call(
                "describe-services",
                &json!({ "cluster": cluster, "services": [service_name] }),
            )
            .await?;
        Ok(active_service(&output))
    }
}

/// The first service of a `DescribeServices` output unless it was deleted
fn active_service(output: &Value) -> Option<Value> {
    output
        .get("services")
        .and_then(Value::as_array)
        .and_then(|services| services.first())
        .filter(|s| s.get("status").and_then(Value::as_str) != Some("INACTIVE"))
        .cloned()
}

#[async_trait]
impl Client for AwsCliClient {
    async fn register_task_definition(&self, td: &TaskDefinition) -> Result<String, PipedError> {
        let output = self
            .call("register-task-definition", &td.register_input())
            .await
            .map_err(|e| {
                PipedError::Internal(format!(
                    "failed to register ECS task definition of family {}: {}",
                    td.family(),
                    e
                ))
            })?;
        let arn = output["taskDefinition"]["taskDefinitionArn"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if arn.is_empty() {
            return Err(PipedError::Internal(
                "registered task definition has no ARN".to_string(),
            ));
        }
        info!("Registered ECS task definition {}", arn);
        Ok(arn)
    }

    async fn service_exists(&self, cluster: &str, service_name: &str) -> Result<bool, PipedError> {
        match self.describe(cluster, service_name).await {
            Ok(service) => Ok(service.is_some()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_service(&self, sd: &ServiceDefinition, task_definition_arn: &str) -> Result<(), PipedError> {
        self.call("create-service", &sd.create_input(task_definition_arn))
            .await
            .map_err(|e| {
                PipedError::Internal(format!(
                    "failed to create ECS service {}: {}",
                    sd.service_name(),
                    e
                ))
            })?;
        Ok(())
    }

    async fn update_service(&self, sd: &ServiceDefinition, task_definition_arn: &str) -> Result<(), PipedError> {
        self.call("update-service", &sd.update_input(task_definition_arn))
            .await
            .map_err(|e| {
                PipedError::Internal(format!(
                    "failed to update ECS service {}: {}",
                    sd.service_name(),
                    e
                ))
            })?;
        Ok(())
    }

    async fn describe_service(&self, cluster: &str, service_name: &str) -> Result<ServiceDefinition, PipedError> {
        match self.describe(cluster, service_name).await? {
            Some(service) => ServiceDefinition::from_value(service),
            None => Err(PipedError::NotFound(format!(
                "ECS service {} was not found in cluster {}",
                service_name, cluster
            ))),
        }
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinition, PipedError> {
        let output = self
            .call(
                "describe-task-definition",
                &json!({ "taskDefinition": arn, "include": ["TAGS"] }),
            )
            .await?;
        let mut body = output["taskDefinition"].clone();
        if let (Some(obj), Some(tags)) = (body.as_object_mut(), output.get("tags")) {
            obj.insert("tags".to_string(), tags.clone());
        }
        TaskDefinition::from_value(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_service() {
        let output = json!({ "services": [{ "serviceName": "a", "status": "ACTIVE" }] });
        assert_eq!(active_service(&output).unwrap()["serviceName"], "a");

        let output = json!({ "services": [{ "serviceName": "a", "status": "INACTIVE" }] });
        assert!(active_service(&output).is_none());

        let output = json!({ "services": [], "failures": [{ "reason": "MISSING" }] });
        assert!(active_service(&output).is_none());
    }
}
