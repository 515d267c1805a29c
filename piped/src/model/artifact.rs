use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    #[default]
    Unknown,
    ContainerImage,
    S3Object,
    GitSource,
    TerraformModule,
}

/// A versioned artifact a deployment ships (image, module, object...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVersion {
    pub kind: ArtifactKind,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
}

impl ArtifactVersion {
    pub fn unknown() -> Self {
        Self {
            kind: ArtifactKind::Unknown,
            version: "unknown".to_string(),
            name: String::new(),
            url: String::new(),
        }
    }

    pub fn container_image(name: impl Into<String>, tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::ContainerImage,
            version: tag.into(),
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Compact display form of a set of versions, e.g. `v0.1.0, v0.2.0`
pub fn summarize_versions(versions: &[ArtifactVersion]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for v in versions {
        if !out.contains(&v.version.as_str()) {
            out.push(v.version.as_str());
        }
    }
    out.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_versions() {
        let versions = vec![
            ArtifactVersion::container_image("helloworld", "v0.1.0", "gcr.io/helloworld:v0.1.0"),
            ArtifactVersion::container_image("envoy", "v1.10.0", "envoy:v1.10.0"),
            ArtifactVersion::container_image("helloworld-2", "v0.1.0", "gcr.io/helloworld-2:v0.1.0"),
        ];
        assert_eq!(summarize_versions(&versions), "v0.1.0, v1.10.0");
        assert_eq!(summarize_versions(&[]), "");
    }
}
