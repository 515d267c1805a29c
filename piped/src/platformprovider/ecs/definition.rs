use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::errors::PipedError;
use crate::model::ArtifactVersion;
use crate::platformprovider::parse_container_image;

const TASK_DEFINITION_FIELDS: &[&str] = &[
    "family",
    "containerDefinitions",
    "requiresCompatibilities",
    "executionRoleArn",
    "taskRoleArn",
    "networkMode",
    "volumes",
    "cpu",
    "memory",
    "placementConstraints",
    "runtimePlatform",
    "ephemeralStorage",
    "tags",
];

const CREATE_SERVICE_FIELDS: &[&str] = &[
    "serviceName",
    "desiredCount",
    "launchType",
    "capacityProviderStrategy",
    "networkConfiguration",
    "loadBalancers",
    "deploymentConfiguration",
    "deploymentController",
    "enableECSManagedTags",
    "enableExecuteCommand",
    "healthCheckGracePeriodSeconds",
    "placementConstraints",
    "placementStrategy",
    "platformVersion",
    "propagateTags",
    "schedulingStrategy",
    "serviceRegistries",
    "tags",
];

const UPDATE_SERVICE_FIELDS: &[&str] = &[
    "desiredCount",
    "capacityProviderStrategy",
    "networkConfiguration",
    "loadBalancers",
    "deploymentConfiguration",
    "enableExecuteCommand",
    "healthCheckGracePeriodSeconds",
    "placementConstraints",
    "placementStrategy",
    "platformVersion",
    "serviceRegistries",
];

async fn load_yaml(app_dir: &Path, filename: &str, what: &str) -> Result<Value, PipedError> {
    let data = tokio::fs::read_to_string(app_dir.join(filename))
        .await
        .map_err(|e| PipedError::Config(format!("failed to read {} {} ({})", what, filename, e)))?;
    Ok(serde_yaml::from_str(&data)?)
}

fn pick(body: &Value, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|f| body.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

/// `[{key, value}]` tag list form used by ECS
fn merge_tags(body: &mut Value, tags: &BTreeMap<String, String>) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let mut merged: BTreeMap<String, String> = obj
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| {
                    Some((
                        t.get("key")?.as_str()?.to_string(),
                        t.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    let list = merged
        .into_iter()
        .map(|(key, value)| serde_json::json!({ "key": key, "value": value }))
        .collect();
    obj.insert("tags".to_string(), Value::Array(list));
}

/// ECS task definition as declared in Git
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub body: Value,
}

impl TaskDefinition {
    pub fn from_value(body: Value) -> Result<Self, PipedError> {
        let td = Self { body };
        if td.family().is_empty() {
            return Err(PipedError::Validation("task definition has no family".to_string()));
        }
        Ok(td)
    }

    pub async fn load(app_dir: &Path, filename: &str) -> Result<Self, PipedError> {
        Self::from_value(load_yaml(app_dir, filename, "task definition").await?)
    }

    pub fn family(&self) -> &str {
        self.body.get("family").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn container_images(&self) -> Vec<String> {
        self.body
            .get("containerDefinitions")
            .and_then(Value::as_array)
            .map(|defs| {
                defs.iter()
                    .filter_map(|d| d.get("image").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn artifact_versions(&self) -> Vec<ArtifactVersion> {
        let mut versions: Vec<ArtifactVersion> = Vec::new();
        for image in self.container_images() {
            let parsed = parse_container_image(&image);
            let version = ArtifactVersion::container_image(parsed.name, parsed.tag, &image);
            if !versions.contains(&version) {
                versions.push(version);
            }
        }
        versions
    }

    pub fn add_tags(&mut self, tags: &BTreeMap<String, String>) {
        merge_tags(&mut self.body, tags);
    }

    /// `RegisterTaskDefinition` input
    pub fn register_input(&self) -> Value {
        Value::Object(pick(&self.body, TASK_DEFINITION_FIELDS))
    }
}

/// ECS service definition as declared in Git
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub body: Value,
}

impl ServiceDefinition {
    pub fn from_value(body: Value) -> Result<Self, PipedError> {
        let sd = Self { body };
        if sd.service_name().is_empty() {
            return Err(PipedError::Validation("service definition has no serviceName".to_string()));
        }
        if sd.cluster().is_empty() {
            return Err(PipedError::Validation("service definition has no cluster".to_string()));
        }
        Ok(sd)
    }

    pub async fn load(app_dir: &Path, filename: &str) -> Result<Self, PipedError> {
        Self::from_value(load_yaml(app_dir, filename, "service definition").await?)
    }

    pub fn service_name(&self) -> &str {
        self.body.get("serviceName").and_then(Value::as_str).unwrap_or_default()
    }

    /// `cluster`, or `clusterArn` as written by `describe-services`
    pub fn cluster(&self) -> &str {
        self.body
            .get("cluster")
            .or_else(|| self.body.get("clusterArn"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn add_tags(&mut self, tags: &BTreeMap<String, String>) {
        merge_tags(&mut self.body, tags);
    }

    pub fn create_input(&self, task_definition_arn: &str) -> Value {
        let mut input = pick(&self.body, CREATE_SERVICE_FIELDS);
        input.insert("cluster".to_string(), Value::from(self.cluster()));
        input.insert("taskDefinition".to_string(), Value::from(task_definition_arn));
        if let Some(role) = self.body.get("roleArn").or_else(|| self.body.get("role")) {
            input.insert("role".to_string(), role.clone());
        }
        Value::Object(input)
    }

    pub fn update_input(&self, task_definition_arn: &str) -> Value {
        let mut input = pick(&self.body, UPDATE_SERVICE_FIELDS);
        input.insert("cluster".to_string(), Value::from(self.cluster()));
        input.insert("service".to_string(), Value::from(self.service_name()));
        input.insert("taskDefinition".to_string(), Value::from(task_definition_arn));
        Value::Object(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKDEF: &str = r#"
family: simple
executionRoleArn: arn:aws:iam::123:role/ecsTaskExecutionRole
networkMode: awsvpc
cpu: "256"
memory: "512"
containerDefinitions:
  - name: web
    image: gcr.io/pipecd/helloworld:v0.1.0
  - name: sidecar
    image: envoyproxy/envoy:v1.27.0
"#;

    const SERVICEDEF: &str = r#"
cluster: arn:aws:ecs:ap-northeast-1:123:cluster/test
serviceName: simple
desiredCount: 2
launchType: FARGATE
schedulingStrategy: REPLICA
tags:
  - key: team
    value: a
"#;

    #[test]
    fn test_task_definition() {
        let mut td = TaskDefinition::from_value(serde_yaml::from_str(TASKDEF).unwrap()).unwrap();
        assert_eq!(td.family(), "simple");
        let versions = td.artifact_versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].name, "helloworld");
        assert_eq!(versions[0].version, "v0.1.0");

        let mut tags = BTreeMap::new();
        tags.insert("pipecd-dev-managed-by".to_string(), "piped".to_string());
        td.add_tags(&tags);
        let input = td.register_input();
        assert_eq!(input["tags"][0]["key"], "pipecd-dev-managed-by");
        assert_eq!(input["cpu"], "256");
    }

    #[test]
    fn test_service_definition_inputs() {
        let sd = ServiceDefinition::from_value(serde_yaml::from_str(SERVICEDEF).unwrap()).unwrap();
        let create = sd.create_input("arn:td:1");
        assert_eq!(create["cluster"], "arn:aws:ecs:ap-northeast-1:123:cluster/test");
        assert_eq!(create["taskDefinition"], "arn:td:1");
        assert_eq!(create["launchType"], "FARGATE");

        let update = sd.update_input("arn:td:2");
        assert_eq!(update["service"], "simple");
        assert_eq!(update["desiredCount"], 2);
        assert!(update.get("launchType").is_none());
        assert!(update.get("tags").is_none());
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(TaskDefinition::from_value(serde_json::json!({ "cpu": "256" })).is_err());
        assert!(ServiceDefinition::from_value(serde_json::json!({ "serviceName": "x" })).is_err());
    }
}
