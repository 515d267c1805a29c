use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::PipedError;
use crate::model::{ArtifactKind, ArtifactVersion};
use crate::platformprovider::{decide_revision_name, parse_container_image};

pub const VERSION_V1BETA1: &str = "pipecd.dev/v1beta1";
pub const FUNCTION_MANIFEST_KIND: &str = "LambdaFunction";

const MEMORY_LOWER_LIMIT: i32 = 1;
const TIMEOUT_LOWER_LIMIT: i32 = 1;
const TIMEOUT_UPPER_LIMIT: i32 = 900;
const EPHEMERAL_STORAGE_LOWER_LIMIT: i32 = 512;
const EPHEMERAL_STORAGE_UPPER_LIMIT: i32 = 10240;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionManifest {
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    pub spec: FunctionManifestSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionManifestSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, rename = "image")]
    pub image_uri: String,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_key: String,
    #[serde(default)]
    pub s3_object_version: String,
    #[serde(default, rename = "source")]
    pub source_code: SourceCode,
    #[serde(default)]
    pub handler: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<Architecture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<EphemeralStorage>,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub memory: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_config: Option<VpcConfig>,
    /// Layer ARNs including their version, ignored for container images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCode {
    #[serde(default)]
    pub git: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralStorage {
    #[serde(default)]
    pub size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

impl FunctionManifest {
    pub fn parse(data: &str) -> Result<Self, PipedError> {
        let fm: FunctionManifest = serde_yaml::from_str(data)?;
        fm.validate()?;
        Ok(fm)
    }

    pub async fn load(app_dir: &Path, filename: &str) -> Result<Self, PipedError> {
        let data = tokio::fs::read_to_string(app_dir.join(filename))
            .await
            .map_err(|e| PipedError::Config(format!("failed to read function manifest {} ({})", filename, e)))?;
        Self::parse(&data)
    }

    pub fn validate(&self) -> Result<(), PipedError> {
        if self.api_version != VERSION_V1BETA1 {
            return Err(invalid(format!("unsupported version: {}", self.api_version)));
        }
        if self.kind != FUNCTION_MANIFEST_KIND {
            return Err(invalid(format!("invalid manifest kind given: {}", self.kind)));
        }
        self.spec.validate()
    }

    pub fn decide_revision_name(&self, commit: &str) -> Result<String, PipedError> {
        let image = parse_container_image(&self.spec.image_uri);
        if image.name.is_empty() {
            return Err(invalid("image name could not be empty".to_string()));
        }
        Ok(decide_revision_name(&self.spec.name, &image.tag, commit))
    }

    /// The artifact this function ships: an image, an S3 object or a Git source
    pub fn artifact_versions(&self) -> Result<Vec<ArtifactVersion>, PipedError> {
        let spec = &self.spec;
        if !spec.image_uri.is_empty() {
            let image = parse_container_image(&spec.image_uri);
            if image.name.is_empty() {
                return Err(invalid("image name could not be empty".to_string()));
            }
            return Ok(vec![ArtifactVersion::container_image(image.name, image.tag, &spec.image_uri)]);
        }

        if !spec.s3_object_version.is_empty() {
            return Ok(vec![ArtifactVersion {
                kind: ArtifactKind::S3Object,
                version: spec.s3_object_version.clone(),
                name: spec.s3_key.clone(),
                url: format!(
                    "https://console.aws.amazon.com/s3/object/{}?prefix={}",
                    spec.s3_bucket, spec.s3_key
                ),
            }]);
        }

        if !spec.source_code.reference.is_empty() {
            let (name, url) = git_commit_url(&spec.source_code.git, &spec.source_code.reference)?;
            return Ok(vec![ArtifactVersion {
                kind: ArtifactKind::GitSource,
                version: spec.source_code.reference.clone(),
                name,
                url,
            }]);
        }

        Err(invalid("couldn't determine artifact versions".to_string()))
    }
}

impl FunctionManifestSpec {
    fn validate(&self) -> Result<(), PipedError> {
        if self.name.is_empty() {
            return Err(invalid("lambda function is missing".to_string()));
        }
        if self.image_uri.is_empty() && self.s3_bucket.is_empty() {
            if self.source_code.git.is_empty() {
                return Err(invalid("remote git source is missing".to_string()));
            }
            if self.source_code.reference.is_empty() {
                return Err(invalid("source ref is missing".to_string()));
            }
        }
        if self.image_uri.is_empty() {
            if self.handler.is_empty() {
                return Err(invalid("handler is missing".to_string()));
            }
            if self.runtime.is_empty() {
                return Err(invalid("runtime is missing".to_string()));
            }
        }
        for arch in &self.architectures {
            if arch.name != "x86_64" && arch.name != "arm64" {
                return Err(invalid(format!("architecture is invalid: {}", arch.name)));
            }
        }
        if let Some(storage) = &self.ephemeral_storage {
            if !(EPHEMERAL_STORAGE_LOWER_LIMIT..=EPHEMERAL_STORAGE_UPPER_LIMIT).contains(&storage.size) {
                return Err(invalid("ephemeral storage is invalid: ephemeral storage is out of range".to_string()));
            }
        }
        if self.role.is_empty() {
            return Err(invalid("role is missing".to_string()));
        }
        if self.memory < MEMORY_LOWER_LIMIT {
            return Err(invalid("memory is missing".to_string()));
        }
        if !(TIMEOUT_LOWER_LIMIT..=TIMEOUT_UPPER_LIMIT).contains(&self.timeout) {
            return Err(invalid("timeout is missing or out of range".to_string()));
        }
        Ok(())
    }
}

fn invalid(message: String) -> PipedError {
    PipedError::Validation(message)
}

/// Repository path and commit page of `reference` for the well-known hosts.
/// Other hosts get an empty name and URL.
fn git_commit_url(remote: &str, reference: &str) -> Result<(String, String), PipedError> {
    let (scheme, host, path) = split_git_url(remote)?;
    let scheme = if scheme == "ssh" { "https".to_string() } else { scheme };
    let repo_path = path.trim_matches('/').trim_end_matches(".git").to_string();

    let url = match host.as_str() {
        "github.com" | "gitlab.com" => format!("{}://{}/{}/commit/{}", scheme, host, repo_path, reference),
        "bitbucket.org" => format!("{}://{}/{}/commits/{}", scheme, host, repo_path, reference),
        _ => return Ok((String::new(), String::new())),
    };
    Ok((repo_path, url))
}

/// Accepts URLs and the scp-like `git@host:org/repo.git` form
fn split_git_url(remote: &str) -> Result<(String, String, String), PipedError> {
    if !remote.contains("://") {
        if let Some((user_host, path)) = remote.split_once(':') {
            let host = user_host.rsplit('@').next().unwrap_or(user_host);
            return Ok(("ssh".to_string(), host.to_string(), path.to_string()));
        }
    }
    let parsed = url::Url::parse(remote)
        .map_err(|e| invalid(format!("failed to parse git url {} ({})", remote, e)))?;
    Ok((
        parsed.scheme().to_string(),
        parsed.host_str().unwrap_or_default().to_string(),
        parsed.path().to_string(),
    ))
}
