use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::resourcekey::{ResourceKey, DEFAULT_NAMESPACE};
use crate::errors::PipedError;

/// One Kubernetes object as declared in Git or read from the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub key: ResourceKey,
    pub body: Value,
}

impl Manifest {
    pub fn from_value(body: Value) -> Result<Self, PipedError> {
        let field = |path: &[&str]| -> String {
            lookup(&body, path)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let kind = field(&["kind"]);
        if kind.is_empty() {
            return Err(PipedError::Validation("manifest has no kind".to_string()));
        }
        let mut namespace = field(&["metadata", "namespace"]);
        if namespace.is_empty() {
            namespace = DEFAULT_NAMESPACE.to_string();
        }
        let key = ResourceKey::new(
            field(&["apiVersion"]),
            kind,
            namespace,
            field(&["metadata", "name"]),
        );
        Ok(Self { key, body })
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn nested(&self, path: &[&str]) -> Option<&Value> {
        lookup(&self.body, path)
    }

    /// Merge `labels` into `metadata.labels`
    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) {
        self.merge_metadata_map("labels", labels);
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.nested(&["metadata", "labels"]))
    }

    /// Set the namespace when the manifest does not declare one
    pub fn default_namespace(&mut self, namespace: &str) {
        if namespace.is_empty() || lookup(&self.body, &["metadata", "namespace"]).is_some() {
            return;
        }
        if let Some(metadata) = object_entry(&mut self.body, "metadata") {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
            self.key.namespace = namespace.to_string();
        }
    }

    /// Container images of a workload's pod template
    pub fn container_images(&self) -> Vec<String> {
        self.nested(&["spec", "template", "spec", "containers"])
            .and_then(Value::as_array)
            .map(|containers| {
                containers
                    .iter()
                    .filter_map(|c| c.get("image").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String, PipedError> {
        Ok(serde_yaml::to_string(&self.body)?)
    }

    fn merge_metadata_map(&mut self, field: &str, values: &BTreeMap<String, String>) {
        if values.is_empty() {
            return;
        }
        let Some(metadata) = object_entry(&mut self.body, "metadata") else {
            return;
        };
        let target = metadata
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        if let Value::Object(map) = target {
            for (k, v) in values {
                map.insert(k.clone(), Value::String(v.clone()));
            }
        }
    }
}

/// Parse every document of a (multi-document) YAML stream. Empty documents are skipped.
pub fn parse_manifests(data: &str) -> Result<Vec<Manifest>, PipedError> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let body: Value = serde_yaml::from_value(value)?;
        manifests.push(Manifest::from_value(body)?);
    }
    Ok(manifests)
}

pub(crate) fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn object_entry<'a>(body: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    let root = body.as_object_mut()?;
    let entry = root
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    entry.as_object_mut()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: simple
  labels:
    app: simple
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: helloworld
          image: gcr.io/pipecd/helloworld:v0.1.0
        - name: envoy
          image: envoyproxy/envoy:v1.10.0
---
---
apiVersion: v1
kind: Service
metadata:
  name: simple
  namespace: web
spec:
  ports:
    - port: 9085
"#;

    #[test]
    fn test_parse_manifests() {
        let manifests = parse_manifests(MANIFESTS).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].key.to_string(), "apps/v1:Deployment:default:simple");
        assert_eq!(manifests[1].key.namespace, "web");
        assert_eq!(
            manifests[0].container_images(),
            vec!["gcr.io/pipecd/helloworld:v0.1.0", "envoyproxy/envoy:v1.10.0"]
        );
    }

    #[test]
    fn test_labels_and_namespace() {
        let mut manifests = parse_manifests(MANIFESTS).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("pipecd.dev/managed-by".to_string(), "piped".to_string());
        manifests[0].add_labels(&labels);
        manifests[0].default_namespace("prod");
        manifests[1].default_namespace("prod");

        let got = manifests[0].labels();
        assert_eq!(got["app"], "simple");
        assert_eq!(got["pipecd.dev/managed-by"], "piped");
        assert_eq!(manifests[0].key.namespace, "prod");
        assert_eq!(manifests[1].key.namespace, "web");
        assert!(manifests[0].to_yaml().unwrap().contains("namespace: prod"));
    }

    #[test]
    fn test_missing_kind() {
        assert!(parse_manifests("apiVersion: v1\nmetadata:\n  name: x\n").is_err());
    }
}
