use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PipedError;
use crate::platformprovider::{decide_revision_name, parse_container_image};

/// One entry of `spec.traffic`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTraffic {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision_name: String,
    #[serde(default)]
    pub percent: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub latest_revision: bool,
}

impl RevisionTraffic {
    pub fn new(revision_name: impl Into<String>, percent: u32) -> Self {
        Self {
            revision_name: revision_name.into(),
            percent,
            ..Default::default()
        }
    }
}

/// A Knative `Service` object as declared in Git or returned by the API
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceManifest {
    pub name: String,
    pub body: Value,
}

impl ServiceManifest {
    pub fn parse(data: &str) -> Result<Self, PipedError> {
        let body: Value = serde_yaml::from_str(data)?;
        Self::from_value(body)
    }

    pub fn from_value(body: Value) -> Result<Self, PipedError> {
        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(PipedError::Validation("service manifest has no metadata.name".to_string()));
        }
        Ok(Self { name, body })
    }

    pub async fn load(app_dir: &Path, filename: &str) -> Result<Self, PipedError> {
        let data = tokio::fs::read_to_string(app_dir.join(filename))
            .await
            .map_err(|e| PipedError::Config(format!("failed to read service manifest {} ({})", filename, e)))?;
        Self::parse(&data)
    }

    /// Name the revision the next apply creates, clear it with an empty name
    pub fn set_revision(&mut self, name: &str) -> Result<(), PipedError> {
        let metadata = object_at(&mut self.body, &["spec", "template", "metadata"])?;
        if name.is_empty() {
            metadata.remove("name");
        } else {
            metadata.insert("name".to_string(), Value::String(name.to_string()));
        }
        Ok(())
    }

    pub fn revision(&self) -> &str {
        self.body
            .pointer("/spec/template/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn update_traffic(&mut self, traffic: &[RevisionTraffic]) -> Result<(), PipedError> {
        let items = serde_json::to_value(traffic)?;
        object_at(&mut self.body, &["spec"])?.insert("traffic".to_string(), items);
        Ok(())
    }

    pub fn traffic(&self) -> Vec<RevisionTraffic> {
        self.body
            .pointer("/spec/traffic")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) -> Result<(), PipedError> {
        merge_labels(object_at(&mut self.body, &["metadata"])?, labels);
        Ok(())
    }

    /// Labels of the revision template
    pub fn add_revision_labels(&mut self, labels: &BTreeMap<String, String>) -> Result<(), PipedError> {
        merge_labels(object_at(&mut self.body, &["spec", "template", "metadata"])?, labels);
        Ok(())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.body
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Image of the first container
    pub fn image(&self) -> Result<&str, PipedError> {
        let containers = self
            .body
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipedError::Validation("spec.template.spec.containers was missing".to_string()))?;
        containers[0]
            .get("image")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipedError::Validation("image was missing".to_string()))
    }

    pub fn image_tag(&self) -> Result<String, PipedError> {
        Ok(parse_container_image(self.image()?).tag)
    }

    pub fn decide_revision_name(&self, commit: &str) -> Result<String, PipedError> {
        let tag = self.image_tag()?;
        Ok(decide_revision_name(&self.name, &tag, commit))
    }

    pub fn to_yaml(&self) -> Result<String, PipedError> {
        Ok(serde_yaml::to_string(&self.body)?)
    }
}

fn object_at<'a>(body: &'a mut Value, path: &[&str]) -> Result<&'a mut Map<String, Value>, PipedError> {
    let mut current = body;
    for key in path {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| PipedError::Validation(format!("{} is not a map", key)))?;
        current = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| PipedError::Validation(format!("{} is not a map", path.join("."))))
}

fn merge_labels(metadata: &mut Map<String, Value>, labels: &BTreeMap<String, String>) {
    let target = metadata
        .entry("labels".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = target {
        for (k, v) in labels {
            map.insert(k.clone(), Value::String(v.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = r#"
apiVersion: serving.knative.dev/v1
kind: Service
metadata:
  name: helloworld
  labels:
    cloud.googleapis.com/location: asia-northeast1
spec:
  template:
    metadata:
      annotations:
        autoscaling.knative.dev/maxScale: '1'
    spec:
      containers:
        - image: gcr.io/pipecd/helloworld:v0.5.0
          args:
            - server
"#;

    #[test]
    fn test_revision_and_traffic() {
        let mut sm = ServiceManifest::parse(SERVICE).unwrap();
        assert_eq!(sm.name, "helloworld");
        let revision = sm.decide_revision_name("bbdc2ed674ce4fd987").unwrap();
        assert_eq!(revision, "helloworld-v050-bbdc2ed");

        sm.set_revision(&revision).unwrap();
        sm.update_traffic(&[RevisionTraffic::new(&revision, 80), RevisionTraffic::new("old", 20)])
            .unwrap();
        assert_eq!(sm.revision(), "helloworld-v050-bbdc2ed");
        assert_eq!(sm.traffic().len(), 2);
        assert_eq!(sm.traffic()[1].percent, 20);

        sm.set_revision("").unwrap();
        assert_eq!(sm.revision(), "");
        let yaml = sm.to_yaml().unwrap();
        assert!(yaml.contains("revisionName: old"));
        assert!(!yaml.contains("tag:"));
    }

    #[test]
    fn test_labels() {
        let mut sm = ServiceManifest::parse(SERVICE).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("pipecd-dev-managed-by".to_string(), "piped".to_string());
        sm.add_labels(&labels).unwrap();
        sm.add_revision_labels(&labels).unwrap();
        assert_eq!(sm.labels().len(), 2);
        assert_eq!(
            sm.body.pointer("/spec/template/metadata/labels/pipecd-dev-managed-by"),
            Some(&Value::from("piped"))
        );
    }

    #[test]
    fn test_missing_image() {
        let sm = ServiceManifest::parse("metadata:\n  name: x\nspec:\n  template:\n    spec: {}\n").unwrap();
        assert!(sm.image_tag().is_err());
        assert!(ServiceManifest::parse("spec: {}\n").is_err());
    }
}
