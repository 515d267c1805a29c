//! `kubectl` backed applier

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::manifest::Manifest;
use super::resourcekey::ResourceKey;
use super::Applier;
use crate::config::piped::KubernetesProviderConfig;
use crate::errors::PipedError;

/// Kinds listed when reading the live state of an application
const LIVE_KINDS: &str = "deployments,replicasets,daemonsets,statefulsets,services,configmaps,secrets,ingresses,jobs,cronjobs";

pub struct Kubectl {
    path: PathBuf,
    kube_config: String,
    master_url: String,
}

impl Kubectl {
    pub fn new(path: PathBuf, config: &KubernetesProviderConfig) -> Self {
        Self {
            path,
            kube_config: config.kube_config_path.clone(),
            master_url: config.master_url.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        if !self.kube_config.is_empty() {
            cmd.arg("--kubeconfig").arg(&self.kube_config);
        }
        if !self.master_url.is_empty() {
            cmd.arg("--server").arg(&self.master_url);
        }
        cmd
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, PipedError> {
        debug!("Running kubectl {}", args.join(" "));
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("NotFound") || stderr.contains("not found") {
                return Err(PipedError::NotFound(stderr));
            }
            return Err(PipedError::Internal(format!(
                "kubectl {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Applier for Kubectl {
    async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), PipedError> {
        let yaml = manifest.to_yaml()?;
        self.run(
            &["apply", "--namespace", &manifest.key.namespace, "-f", "-"],
            Some(&yaml),
        )
        .await?;
        Ok(())
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<(), PipedError> {
        self.run(
            &["delete", "--namespace", &key.namespace, &key.kind, &key.name],
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_managed_manifests(&self, selector: &str) -> Result<Vec<Manifest>, PipedError> {
        let out = self
            .run(
                &["get", LIVE_KINDS, "--all-namespaces", "-l", selector, "-o", "json"],
                None,
            )
            .await?;
        parse_list(&out)
    }
}

/// Items of a `kubectl get -o json` List, without the fields the server owns
fn parse_list(out: &str) -> Result<Vec<Manifest>, PipedError> {
    let list: Value = serde_json::from_str(out)?;
    let items = list
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut manifests = Vec::with_capacity(items.len());
    for mut item in items {
        if let Some(root) = item.as_object_mut() {
            root.remove("status");
            if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
                for field in ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields", "selfLink"] {
                    metadata.remove(field);
                }
            }
        }
        manifests.push(Manifest::from_value(item)?);
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_strips_server_fields() {
        let out = r#"{
            "apiVersion": "v1",
            "kind": "List",
            "items": [{
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "simple", "namespace": "default", "uid": "x", "resourceVersion": "12"},
                "spec": {"replicas": 2},
                "status": {"readyReplicas": 2}
            }]
        }"#;
        let manifests = parse_list(out).unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].key.to_string(), "apps/v1:Deployment:default:simple");
        assert!(manifests[0].nested(&["status"]).is_none());
        assert!(manifests[0].nested(&["metadata", "uid"]).is_none());
        assert_eq!(manifests[0].nested(&["spec", "replicas"]), Some(&Value::from(2)));
    }
}
