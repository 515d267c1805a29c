//! AWS Lambda client
//!
//! All traffic goes through the function alias `Service`. Its primary version
//! is `FunctionVersion`, the secondary is the single entry of
//! `RoutingConfig.AdditionalVersionWeights`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use super::manifest::FunctionManifest;
use super::traffic::{percent_to_weight, weight_to_percent, RoutingTrafficConfig, VersionTraffic};
use crate::config::piped::AwsProviderConfig;
use crate::errors::PipedError;
use crate::platformprovider::aws::AwsCli;
use crate::utils::Retry;

pub const DEFAULT_ALIAS_NAME: &str = "Service";

const REQUEST_RETRY_TIME: u32 = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Client: Send + Sync {
    async fn is_function_exist(&self, name: &str) -> Result<bool, PipedError>;

    /// Create the function from an image or an S3 object
    async fn create_function(&self, fm: &FunctionManifest) -> Result<(), PipedError>;

    /// Create the function from a zip archive on local disk
    async fn create_function_from_source(&self, fm: &FunctionManifest, zip: &Path) -> Result<(), PipedError>;

    async fn update_function(&self, fm: &FunctionManifest) -> Result<(), PipedError>;

    async fn update_function_from_source(&self, fm: &FunctionManifest, zip: &Path) -> Result<(), PipedError>;

    /// Publish the current code and configuration, returning the version
    async fn publish_function(&self, fm: &FunctionManifest) -> Result<String, PipedError>;

    /// Current alias routing. `NotFound` when the alias does not exist yet.
    async fn get_traffic_config(&self, fm: &FunctionManifest) -> Result<RoutingTrafficConfig, PipedError>;

    async fn create_traffic_config(&self, fm: &FunctionManifest, version: &str) -> Result<(), PipedError>;

    async fn update_traffic_config(
        &self,
        fm: &FunctionManifest,
        routing: &RoutingTrafficConfig,
    ) -> Result<(), PipedError>;
}

/// Client backed by the `aws lambda` CLI
pub struct AwsCliClient {
    cli: AwsCli,
}

impl AwsCliClient {
    pub fn new(config: &AwsProviderConfig) -> Result<Self, PipedError> {
        Ok(Self {
            cli: AwsCli::new(config)?,
        })
    }

    async fn call(&self, operation: &str, input: &Value, extra: &[String]) -> Result<Value, PipedError> {
        self.cli.call("lambda", operation, Some(input), extra).await
    }

    async fn get_function(&self, name: &str) -> Result<Value, PipedError> {
        self.call("get-function", &json!({ "FunctionName": name }), &[]).await
    }

    async fn create(&self, input: Value, extra: &[String]) -> Result<(), PipedError> {
        let name = input["FunctionName"].as_str().unwrap_or_default().to_string();
        self.call("create-function", &input, extra)
            .await
            .map_err(|e| PipedError::Internal(format!("failed to create Lambda function {}: {}", name, e)))?;
        Ok(())
    }

    /// Update the configuration then wait until the function settled.
    /// Configuration updates fail while the function is still pending.
    async fn update_function_configuration(&self, fm: &FunctionManifest) -> Result<(), PipedError> {
        let name = &fm.spec.name;
        let input = &configuration_input(fm);
        let retry = Retry::constant(REQUEST_RETRY_TIME, RETRY_INTERVAL);
        retry
            .run(|| async move {
                self.call("update-function-configuration", input, &[])
                    .await
                    .inspect_err(|e| error!("Failed to update function configuration: {}", e))
            })
            .await
            .map_err(|e| PipedError::Internal(format!("failed to update configuration for Lambda function {}: {}", name, e)))?;

        retry
            .run(|| async move {
                let output = self.get_function(name).await?;
                let status = output
                    .pointer("/Configuration/LastUpdateStatus")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if status != "Successful" {
                    let reason = output
                        .pointer("/Configuration/LastUpdateStatusReason")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Err(PipedError::Retryable(format!(
                        "failed to update Lambda function {}, status code {}, error reason {}",
                        name, status, reason
                    )));
                }
                Ok(())
            })
            .await
    }

    async fn update_function_code(&self, fm: &FunctionManifest, code: Value, extra: &[String]) -> Result<(), PipedError> {
        let mut input = code;
        input["FunctionName"] = Value::from(fm.spec.name.as_str());
        if !fm.spec.architectures.is_empty() {
            input["Architectures"] = architectures(fm);
        }
        self.call("update-function-code", &input, extra)
            .await
            .map_err(|e| {
                PipedError::Internal(format!("failed to update function code for Lambda function {}: {}", fm.spec.name, e))
            })?;
        Ok(())
    }

    async fn update_tags(&self, fm: &FunctionManifest) -> Result<(), PipedError> {
        let name = &fm.spec.name;
        let output = self.get_function(name).await.map_err(|e| {
            PipedError::Internal(format!("error occurred on list tags of Lambda function {}: {}", name, e))
        })?;
        let arn = output
            .pointer("/Configuration/FunctionArn")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let current: BTreeMap<String, String> = output
            .get("Tags")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if current == fm.spec.tags {
            return Ok(());
        }

        let changes = TagChanges::between(&current, &fm.spec.tags);
        if !changes.added.is_empty() {
            self.tag(&arn, &changes.added).await.map_err(|e| {
                PipedError::Internal(format!("failed on add new defined tags to Lambda function {}: {}", name, e))
            })?;
        }
        if !changes.updated.is_empty() {
            let keys: Vec<&String> = changes.updated.keys().collect();
            self.untag(&arn, &keys).await.map_err(|e| {
                PipedError::Internal(format!("failed on update changed tags to Lambda function {}: {}", name, e))
            })?;
            self.tag(&arn, &changes.updated).await.map_err(|e| {
                PipedError::Internal(format!("failed on update changed tags to Lambda function {}: {}", name, e))
            })?;
        }
        if !changes.removed.is_empty() {
            let keys: Vec<&String> = changes.removed.iter().collect();
            self.untag(&arn, &keys).await.map_err(|e| {
                PipedError::Internal(format!("failed on remove tags for Lambda function {}: {}", name, e))
            })?;
        }
        Ok(())
    }

    async fn tag(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<(), PipedError> {
        self.call("tag-resource", &json!({ "Resource": arn, "Tags": tags }), &[])
            .await
            .map(|_| ())
    }

    async fn untag(&self, arn: &str, keys: &[&String]) -> Result<(), PipedError> {
        self.call("untag-resource", &json!({ "Resource": arn, "TagKeys": keys }), &[])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Client for AwsCliClient {
    async fn is_function_exist(&self, name: &str) -> Result<bool, PipedError> {
        match self.get_function(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_function(&self, fm: &FunctionManifest) -> Result<(), PipedError> {
        self.create(create_function_input(fm), &[]).await
    }

    async fn create_function_from_source(&self, fm: &FunctionManifest, zip: &Path) -> Result<(), PipedError> {
        let mut input = create_function_input(fm);
        input["PackageType"] = Value::from("Zip");
        input["Handler"] = Value::from(fm.spec.handler.as_str());
        input["Runtime"] = Value::from(fm.spec.runtime.as_str());
        if let Some(obj) = input.as_object_mut() {
            obj.remove("Code");
        }
        self.create(input, &zip_file_args(zip)).await
    }

    async fn update_function(&self, fm: &FunctionManifest) -> Result<(), PipedError> {
        self.update_function_configuration(fm).await?;

        let spec = &fm.spec;
        let mut code = Map::new();
        if !spec.image_uri.is_empty() {
            code.insert("ImageUri".to_string(), Value::from(spec.image_uri.as_str()));
        }
        if !spec.s3_bucket.is_empty() {
            code.insert("S3Bucket".to_string(), Value::from(spec.s3_bucket.as_str()));
            code.insert("S3Key".to_string(), Value::from(spec.s3_key.as_str()));
            code.insert("S3ObjectVersion".to_string(), Value::from(spec.s3_object_version.as_str()));
        }
        self.update_function_code(fm, Value::Object(code), &[]).await?;
        self.update_tags(fm).await
    }

    async fn update_function_from_source(&self, fm: &FunctionManifest, zip: &Path) -> Result<(), PipedError> {
        self.update_function_configuration(fm).await?;
        self.update_function_code(fm, json!({}), &zip_file_args(zip)).await?;
        self.update_tags(fm).await
    }

    async fn publish_function(&self, fm: &FunctionManifest) -> Result<String, PipedError> {
        let output = self
            .call("publish-version", &json!({ "FunctionName": fm.spec.name }), &[])
            .await
            .map_err(|e| {
                PipedError::Internal(format!("failed to publish new version for Lambda function {}: {}", fm.spec.name, e))
            })?;
        let version = output.get("Version").and_then(Value::as_str).unwrap_or_default();
        info!("Published version {} of Lambda function {}", version, fm.spec.name);
        Ok(version.to_string())
    }

    async fn get_traffic_config(&self, fm: &FunctionManifest) -> Result<RoutingTrafficConfig, PipedError> {
        let alias = self
            .call(
                "get-alias",
                &json!({ "FunctionName": fm.spec.name, "Name": DEFAULT_ALIAS_NAME }),
                &[],
            )
            .await?;
        Ok(routing_from_alias(&alias))
    }

    async fn create_traffic_config(&self, fm: &FunctionManifest, version: &str) -> Result<(), PipedError> {
        let input = json!({
            "FunctionName": fm.spec.name,
            "FunctionVersion": version,
            "Name": DEFAULT_ALIAS_NAME,
        });
        self.call("create-alias", &input, &[]).await.map_err(|e| {
            PipedError::Internal(format!("failed to create traffic config for Lambda function {}: {}", fm.spec.name, e))
        })?;
        Ok(())
    }

    async fn update_traffic_config(
        &self,
        fm: &FunctionManifest,
        routing: &RoutingTrafficConfig,
    ) -> Result<(), PipedError> {
        let input = update_alias_input(&fm.spec.name, routing)?;
        self.call("update-alias", &input, &[]).await.map_err(|e| {
            PipedError::Internal(format!("failed to update traffic config for Lambda function {}: {}", fm.spec.name, e))
        })?;
        Ok(())
    }
}

fn zip_file_args(zip: &Path) -> Vec<String> {
    vec!["--zip-file".to_string(), format!("fileb://{}", zip.display())]
}

fn architectures(fm: &FunctionManifest) -> Value {
    fm.spec
        .architectures
        .iter()
        .map(|a| Value::from(a.name.as_str()))
        .collect()
}

fn vpc_config(fm: &FunctionManifest) -> Option<Value> {
    fm.spec.vpc_config.as_ref().map(|vpc| {
        json!({
            "SecurityGroupIds": vpc.security_group_ids,
            "SubnetIds": vpc.subnet_ids,
        })
    })
}

fn create_function_input(fm: &FunctionManifest) -> Value {
    let spec = &fm.spec;
    let mut input = json!({
        "FunctionName": spec.name,
        "Role": spec.role,
        "MemorySize": spec.memory,
        "Timeout": spec.timeout,
        "Tags": spec.tags,
        "Environment": { "Variables": spec.environments },
    });
    if !spec.architectures.is_empty() {
        input["Architectures"] = architectures(fm);
    }
    if let Some(storage) = spec.ephemeral_storage.as_ref().filter(|s| s.size != 0) {
        input["EphemeralStorage"] = json!({ "Size": storage.size });
    }
    if let Some(vpc) = vpc_config(fm) {
        input["VpcConfig"] = vpc;
    }
    if !spec.image_uri.is_empty() {
        input["PackageType"] = Value::from("Image");
        input["Code"] = json!({ "ImageUri": spec.image_uri });
    }
    if !spec.s3_bucket.is_empty() {
        input["PackageType"] = Value::from("Zip");
        input["Code"] = json!({
            "S3Bucket": spec.s3_bucket,
            "S3Key": spec.s3_key,
            "S3ObjectVersion": spec.s3_object_version,
        });
        input["Handler"] = Value::from(spec.handler.as_str());
        input["Runtime"] = Value::from(spec.runtime.as_str());
    }
    if !spec.layers.is_empty() && spec.image_uri.is_empty() {
        input["Layers"] = json!(spec.layers);
    }
    input
}

fn configuration_input(fm: &FunctionManifest) -> Value {
    let spec = &fm.spec;
    let mut input = json!({
        "FunctionName": spec.name,
        "Role": spec.role,
        "MemorySize": spec.memory,
        "Timeout": spec.timeout,
        "Environment": { "Variables": spec.environments },
    });
    if !spec.runtime.is_empty() {
        input["Runtime"] = Value::from(spec.runtime.as_str());
    }
    if !spec.handler.is_empty() {
        input["Handler"] = Value::from(spec.handler.as_str());
    }
    if let Some(storage) = spec.ephemeral_storage.as_ref().filter(|s| s.size != 0) {
        input["EphemeralStorage"] = json!({ "Size": storage.size });
    }
    if let Some(vpc) = vpc_config(fm) {
        input["VpcConfig"] = vpc;
    }
    if !spec.layers.is_empty() && spec.image_uri.is_empty() {
        input["Layers"] = json!(spec.layers);
    }
    input
}

/// Read the routing out of a `GetAlias` response.
///
/// Without `RoutingConfig` the function version serves everything. Otherwise
/// the single additional version is the secondary and the primary gets the rest.
fn routing_from_alias(alias: &Value) -> RoutingTrafficConfig {
    let primary_version = alias
        .get("FunctionVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let weights = alias
        .pointer("/RoutingConfig/AdditionalVersionWeights")
        .and_then(Value::as_object);
    let Some(weights) = weights else {
        return RoutingTrafficConfig::all_to(primary_version);
    };

    let mut routing = RoutingTrafficConfig::default();
    let mut secondary_percent = 0.0;
    for (version, weight) in weights {
        secondary_percent = weight_to_percent(weight.as_f64().unwrap_or_default());
        routing.secondary = Some(VersionTraffic::new(version.as_str(), secondary_percent));
    }
    routing.primary = Some(VersionTraffic::new(primary_version, 100.0 - secondary_percent));
    routing
}

fn update_alias_input(function: &str, routing: &RoutingTrafficConfig) -> Result<Value, PipedError> {
    let primary = routing.primary.as_ref().ok_or_else(|| {
        PipedError::Validation("invalid routing traffic configuration given: primary version not found".to_string())
    })?;
    let mut input = json!({
        "FunctionName": function,
        "Name": DEFAULT_ALIAS_NAME,
        "FunctionVersion": primary.version,
    });
    if let Some(secondary) = &routing.secondary {
        let mut weights = Map::new();
        weights.insert(secondary.version.clone(), Value::from(percent_to_weight(secondary.percent)));
        input["RoutingConfig"] = json!({ "AdditionalVersionWeights": weights });
    }
    Ok(input)
}

/// How the remote tags must change to match the declared ones
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TagChanges {
    pub added: BTreeMap<String, String>,
    pub updated: BTreeMap<String, String>,
    pub removed: Vec<String>,
}

impl TagChanges {
    pub fn between(remote: &BTreeMap<String, String>, defined: &BTreeMap<String, String>) -> Self {
        let mut changes = TagChanges::default();
        for (k, v) in defined {
            match remote.get(k) {
                None => {
                    changes.added.insert(k.clone(), v.clone());
                }
                Some(current) if current != v => {
                    changes.updated.insert(k.clone(), v.clone());
                }
                Some(_) => {}
            }
        }
        changes.removed = remote
            .keys()
            .filter(|k| !defined.contains_key(*k))
            .cloned()
            .collect();
        changes
    }
}
