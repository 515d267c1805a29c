//! Piped configuration file

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::duration;
use crate::errors::PipedError;
use crate::model::ApplicationKind;

pub const PIPED_KIND: &str = "Piped";

/// Top-level piped configuration document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedConfig {
    pub api_version: String,
    pub kind: String,
    pub spec: PipedSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedSpec {
    #[serde(rename = "pipedID")]
    pub piped_id: String,

    #[serde(rename = "projectID", default)]
    pub project_id: String,

    /// Base URL of the control-plane API
    pub api_address: String,

    /// File holding the piped key used to authenticate against the control plane
    #[serde(default)]
    pub piped_key_file: Option<PathBuf>,

    /// Inline piped key, `pipedKeyFile` wins when both are set
    #[serde(default)]
    pub piped_key_data: Option<SecretString>,

    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,

    #[serde(default = "default_sync_interval", with = "duration::serde_str")]
    pub sync_interval: Duration,

    #[serde(default = "default_deployment_timeout", with = "duration::serde_str")]
    pub deployment_timeout: Duration,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub repositories: Vec<PipedRepository>,

    #[serde(default)]
    pub platform_providers: Vec<PlatformProvider>,

    #[serde(default)]
    pub insecure_chart_repositories: Vec<String>,

    #[serde(default)]
    pub plan_preview: PlanPreviewConfig,

    #[serde(default)]
    pub drift_detection: DriftDetectionConfig,

    #[serde(default)]
    pub secret_management: Option<SecretManagement>,
}

fn default_working_dir() -> PathBuf {
    std::env::temp_dir().join("piped")
}

fn default_tools_dir() -> PathBuf {
    std::env::temp_dir().join("piped").join("tools")
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_deployment_timeout() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedRepository {
    #[serde(rename = "repoId", alias = "id")]
    pub id: String,
    pub remote: String,
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPreviewConfig {
    /// Plan-preview commands handled concurrently
    #[serde(default = "default_plan_preview_workers")]
    pub worker_num: usize,

    #[serde(default = "default_command_check_interval", with = "duration::serde_str")]
    pub command_check_interval: Duration,
}

fn default_plan_preview_workers() -> usize {
    3
}

fn default_command_check_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for PlanPreviewConfig {
    fn default() -> Self {
        Self {
            worker_num: default_plan_preview_workers(),
            command_check_interval: default_command_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_drift_interval", with = "duration::serde_str")]
    pub interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_drift_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for DriftDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_drift_interval(),
        }
    }
}

/// Where the private key used to decrypt application secrets lives
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManagement {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
}

// =============================== PLATFORM PROVIDERS ================================== //

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesProviderConfig {
    #[serde(rename = "masterURL", default)]
    pub master_url: String,
    #[serde(default)]
    pub kube_config_path: String,
    #[serde(default)]
    pub kubectl_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformProviderConfig {
    /// `key=value` variables passed to every terraform command
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub drift_detection_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunProviderConfig {
    pub project: String,
    pub region: String,
    #[serde(default)]
    pub credentials_file: String,
}

/// Shared by the LAMBDA and ECS providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderConfig {
    pub region: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub credentials_file: String,
    #[serde(rename = "roleARN", default)]
    pub role_arn: String,
    #[serde(default)]
    pub token_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformProviderConfig {
    Kubernetes(KubernetesProviderConfig),
    Terraform(TerraformProviderConfig),
    CloudRun(CloudRunProviderConfig),
    Lambda(AwsProviderConfig),
    Ecs(AwsProviderConfig),
}

impl PlatformProviderConfig {
    pub fn kind(&self) -> ApplicationKind {
        match self {
            PlatformProviderConfig::Kubernetes(_) => ApplicationKind::Kubernetes,
            PlatformProviderConfig::Terraform(_) => ApplicationKind::Terraform,
            PlatformProviderConfig::CloudRun(_) => ApplicationKind::CloudRun,
            PlatformProviderConfig::Lambda(_) => ApplicationKind::Lambda,
            PlatformProviderConfig::Ecs(_) => ApplicationKind::Ecs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlatformProvider {
    name: String,
    #[serde(rename = "type")]
    kind: ApplicationKind,
    #[serde(default)]
    config: Option<serde_yaml::Value>,
}

/// A named binding between an application kind and a runtime
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPlatformProvider")]
pub struct PlatformProvider {
    pub name: String,
    pub config: PlatformProviderConfig,
}

impl PlatformProvider {
    pub fn kind(&self) -> ApplicationKind {
        self.config.kind()
    }
}

impl TryFrom<RawPlatformProvider> for PlatformProvider {
    type Error = String;

    fn try_from(raw: RawPlatformProvider) -> Result<Self, Self::Error> {
        fn decode<T: serde::de::DeserializeOwned + Default>(
            name: &str,
            value: Option<serde_yaml::Value>,
        ) -> Result<T, String> {
            match value {
                None => Ok(T::default()),
                Some(v) => serde_yaml::from_value(v)
                    .map_err(|e| format!("invalid config of platform provider {}: {}", name, e)),
            }
        }

        let config = match raw.kind {
            ApplicationKind::Kubernetes => {
                PlatformProviderConfig::Kubernetes(decode(&raw.name, raw.config)?)
            }
            ApplicationKind::Terraform => {
                PlatformProviderConfig::Terraform(decode(&raw.name, raw.config)?)
            }
            ApplicationKind::CloudRun => {
                PlatformProviderConfig::CloudRun(decode(&raw.name, raw.config)?)
            }
            ApplicationKind::Lambda => PlatformProviderConfig::Lambda(decode(&raw.name, raw.config)?),
            ApplicationKind::Ecs => PlatformProviderConfig::Ecs(decode(&raw.name, raw.config)?),
        };

        Ok(PlatformProvider {
            name: raw.name,
            config,
        })
    }
}

impl PipedSpec {
    /// Platform provider registered under `name`, checked against the expected kind
    pub fn find_platform_provider(
        &self,
        name: &str,
        kind: ApplicationKind,
    ) -> Result<&PlatformProvider, PipedError> {
        let provider = self
            .platform_providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                PipedError::Config(format!("platform provider {} was not found", name))
            })?;
        if provider.kind() != kind {
            return Err(PipedError::Config(format!(
                "platform provider {} is not a {} provider (got {})",
                name,
                kind,
                provider.kind()
            )));
        }
        Ok(provider)
    }

    pub fn platform_providers_of(&self, kind: ApplicationKind) -> impl Iterator<Item = &PlatformProvider> {
        self.platform_providers.iter().filter(move |p| p.kind() == kind)
    }

    pub fn repository(&self, id: &str) -> Option<&PipedRepository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    /// Resolve the piped key, reading `pipedKeyFile` when set
    pub fn load_piped_key(&self) -> Result<SecretString, PipedError> {
        if let Some(path) = &self.piped_key_file {
            let data = std::fs::read_to_string(path)?;
            return Ok(SecretString::from(data.trim().to_string()));
        }
        self.piped_key_data
            .clone()
            .ok_or_else(|| PipedError::Config("either pipedKeyFile or pipedKeyData must be set".to_string()))
    }

    fn validate(&self) -> Result<(), PipedError> {
        if self.piped_id.is_empty() {
            return Err(PipedError::Config("pipedID must be set".to_string()));
        }
        if self.api_address.is_empty() {
            return Err(PipedError::Config("apiAddress must be set".to_string()));
        }
        let mut names = std::collections::HashSet::new();
        for p in &self.platform_providers {
            if !names.insert(p.name.as_str()) {
                return Err(PipedError::Config(format!(
                    "duplicated platform provider name {}",
                    p.name
                )));
            }
        }
        Ok(())
    }
}

impl PipedConfig {
    pub fn parse(data: &str) -> Result<Self, PipedError> {
        let cfg: PipedConfig = serde_yaml::from_str(data)?;
        if cfg.kind != PIPED_KIND {
            return Err(PipedError::Config(format!(
                "unexpected kind {}, expected {}",
                cfg.kind, PIPED_KIND
            )));
        }
        cfg.spec.validate()?;
        Ok(cfg)
    }

    pub async fn load(path: &Path) -> Result<Self, PipedError> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::parse(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  pipedID: piped-1
  projectID: demo
  apiAddress: https://pipecd.example.com
  pipedKeyData: secret-key
  syncInterval: 30s
  repositories:
    - repoId: examples
      remote: git@github.com:pipe-cd/examples.git
      branch: master
  platformProviders:
    - name: kubernetes-default
      type: KUBERNETES
      config:
        kubectlVersion: 1.28.0
    - name: cloudrun-dev
      type: CLOUDRUN
      config:
        project: my-project
        region: asia-northeast1
    - name: terraform-dev
      type: TERRAFORM
      config:
        vars:
          - project=my-project
    - name: lambda-dev
      type: LAMBDA
      config:
        region: us-west-2
"#;

    #[test]
    fn test_parse_piped_config() {
        let cfg = PipedConfig::parse(CONFIG).unwrap();
        let spec = &cfg.spec;
        assert_eq!(spec.piped_id, "piped-1");
        assert_eq!(spec.sync_interval, Duration::from_secs(30));
        assert_eq!(spec.deployment_timeout, Duration::from_secs(3600));
        assert_eq!(spec.repository("examples").unwrap().branch, "master");
        assert_eq!(spec.load_piped_key().unwrap().expose_secret(), "secret-key");

        let provider = spec
            .find_platform_provider("cloudrun-dev", ApplicationKind::CloudRun)
            .unwrap();
        match &provider.config {
            PlatformProviderConfig::CloudRun(c) => assert_eq!(c.region, "asia-northeast1"),
            other => panic!("unexpected config {:?}", other),
        }
        assert_eq!(spec.platform_providers_of(ApplicationKind::Terraform).count(), 1);
    }

    #[test]
    fn test_find_platform_provider_errors() {
        let cfg = PipedConfig::parse(CONFIG).unwrap();
        assert!(cfg
            .spec
            .find_platform_provider("unknown", ApplicationKind::Kubernetes)
            .is_err());
        assert!(cfg
            .spec
            .find_platform_provider("lambda-dev", ApplicationKind::Ecs)
            .is_err());
    }

    #[test]
    fn test_reject_wrong_kind_and_duplicates() {
        let wrong = CONFIG.replace("kind: Piped", "kind: KubernetesApp");
        assert!(PipedConfig::parse(&wrong).is_err());

        let dup = CONFIG.replace("name: cloudrun-dev", "name: kubernetes-default");
        assert!(PipedConfig::parse(&dup).is_err());
    }
}
