//! Application configuration file (`app.pipecd.yaml`)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration;
use crate::config::stage::PipelineConfig;
use crate::errors::PipedError;
use crate::model::ApplicationKind;

pub const KUBERNETES_APP_KIND: &str = "KubernetesApp";
pub const TERRAFORM_APP_KIND: &str = "TerraformApp";
pub const CLOUDRUN_APP_KIND: &str = "CloudRunApp";
pub const LAMBDA_APP_KIND: &str = "LambdaApp";
pub const ECS_APP_KIND: &str = "ECSApp";

/// Map an application config kind (`CloudRunApp`) to an application kind
pub fn application_kind_of(config_kind: &str) -> Option<ApplicationKind> {
    match config_kind {
        KUBERNETES_APP_KIND => Some(ApplicationKind::Kubernetes),
        TERRAFORM_APP_KIND => Some(ApplicationKind::Terraform),
        CLOUDRUN_APP_KIND => Some(ApplicationKind::CloudRun),
        LAMBDA_APP_KIND => Some(ApplicationKind::Lambda),
        ECS_APP_KIND => Some(ApplicationKind::Ecs),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    /// Always use the declared pipeline instead of letting the planner decide
    #[serde(default)]
    pub always_use_pipeline: bool,
}

/// Regexes matched against the trigger commit message to force a strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMatcher {
    #[serde(default)]
    pub quick_sync: String,
    #[serde(default)]
    pub pipeline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEncryption {
    /// Encrypted values keyed by the name used inside templates
    #[serde(default)]
    pub encrypted_secrets: BTreeMap<String, String>,

    /// Files, relative to the application directory, to render
    #[serde(default)]
    pub decryption_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Attachment name to source file, relative to the application directory
    #[serde(default)]
    pub sources: BTreeMap<String, String>,

    /// Files, relative to the application directory, that embed attachments
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnCommit {
    #[serde(default)]
    pub disabled: bool,

    /// Extra paths outside the application directory that trigger a deployment
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub on_commit: OnCommit,
}

/// Part of the application spec shared by every kind
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericApplicationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "duration::serde_str_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub commit_matcher: CommitMatcher,
    #[serde(default)]
    pub encryption: Option<SecretEncryption>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl GenericApplicationSpec {
    pub fn has_pipeline(&self) -> bool {
        self.pipeline
            .as_ref()
            .map(|p| !p.stages.is_empty())
            .unwrap_or(false)
    }
}

fn default_true() -> bool {
    true
}

// ================================= KUBERNETES ===================================== //

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sResourceReference {
    #[serde(default = "default_workload_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

fn default_workload_kind() -> String {
    "Deployment".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploymentInput {
    /// Manifest files relative to the application directory, every yaml file when empty
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub kubectl_version: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

impl Default for KubernetesDeploymentInput {
    fn default() -> Self {
        Self {
            manifests: Vec::new(),
            kubectl_version: String::new(),
            namespace: String::new(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesQuickSync {
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesApplicationSpec {
    #[serde(default)]
    pub input: KubernetesDeploymentInput,
    #[serde(default)]
    pub quick_sync: KubernetesQuickSync,
    /// Workloads whose pod template decides a progressive sync, every Deployment when empty
    #[serde(default)]
    pub workloads: Vec<K8sResourceReference>,
}

// ================================= TERRAFORM ===================================== //

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformCommandFlags {
    #[serde(default)]
    pub shared: Vec<String>,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub apply: Vec<String>,
}

/// Same shape as the flags, values are `KEY=value`
pub type TerraformCommandEnvs = TerraformCommandFlags;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformDeploymentInput {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub terraform_version: String,
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub var_files: Vec<String>,
    #[serde(default)]
    pub command_flags: TerraformCommandFlags,
    #[serde(default)]
    pub command_envs: TerraformCommandEnvs,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

impl Default for TerraformDeploymentInput {
    fn default() -> Self {
        Self {
            workspace: String::new(),
            terraform_version: String::new(),
            vars: Vec::new(),
            var_files: Vec::new(),
            command_flags: TerraformCommandFlags::default(),
            command_envs: TerraformCommandEnvs::default(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformApplicationSpec {
    #[serde(default)]
    pub input: TerraformDeploymentInput,
}

// ================================= CLOUD RUN ===================================== //

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunDeploymentInput {
    #[serde(default = "default_service_manifest_file")]
    pub service_manifest_file: String,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

fn default_service_manifest_file() -> String {
    "service.yaml".to_string()
}

impl Default for CloudRunDeploymentInput {
    fn default() -> Self {
        Self {
            service_manifest_file: default_service_manifest_file(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunApplicationSpec {
    #[serde(default)]
    pub input: CloudRunDeploymentInput,
}

// ================================= LAMBDA ===================================== //

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaDeploymentInput {
    #[serde(default = "default_function_manifest_file")]
    pub function_manifest_file: String,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

fn default_function_manifest_file() -> String {
    "function.yaml".to_string()
}

impl Default for LambdaDeploymentInput {
    fn default() -> Self {
        Self {
            function_manifest_file: default_function_manifest_file(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaApplicationSpec {
    #[serde(default)]
    pub input: LambdaDeploymentInput,
}

// ================================= ECS ===================================== //

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsDeploymentInput {
    #[serde(default = "default_service_definition_file")]
    pub service_definition_file: String,
    #[serde(default = "default_task_definition_file")]
    pub task_definition_file: String,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

fn default_service_definition_file() -> String {
    "servicedef.yaml".to_string()
}

fn default_task_definition_file() -> String {
    "taskdef.yaml".to_string()
}

impl Default for EcsDeploymentInput {
    fn default() -> Self {
        Self {
            service_definition_file: default_service_definition_file(),
            task_definition_file: default_task_definition_file(),
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsApplicationSpec {
    #[serde(default)]
    pub input: EcsDeploymentInput,
}

// ================================= ENVELOPE ===================================== //

#[derive(Debug, Clone)]
pub enum KindSpec {
    Kubernetes(KubernetesApplicationSpec),
    Terraform(TerraformApplicationSpec),
    CloudRun(CloudRunApplicationSpec),
    Lambda(LambdaApplicationSpec),
    Ecs(EcsApplicationSpec),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawApplicationConfig {
    #[serde(default)]
    api_version: String,
    kind: String,
    #[serde(default)]
    spec: Option<serde_yaml::Value>,
}

/// Parsed application configuration
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub api_version: String,
    pub kind: ApplicationKind,
    pub generic: GenericApplicationSpec,
    pub spec: KindSpec,
}

impl ApplicationConfig {
    pub fn parse(data: &str) -> Result<Self, PipedError> {
        let raw: RawApplicationConfig = serde_yaml::from_str(data)?;
        let kind = application_kind_of(&raw.kind).ok_or_else(|| {
            PipedError::Config(format!("unsupported application config kind {}", raw.kind))
        })?;
        let spec_value = raw
            .spec
            .unwrap_or(serde_yaml::Value::Mapping(Default::default()));

        let generic: GenericApplicationSpec = serde_yaml::from_value(spec_value.clone())?;
        let spec = match kind {
            ApplicationKind::Kubernetes => KindSpec::Kubernetes(serde_yaml::from_value(spec_value)?),
            ApplicationKind::Terraform => KindSpec::Terraform(serde_yaml::from_value(spec_value)?),
            ApplicationKind::CloudRun => KindSpec::CloudRun(serde_yaml::from_value(spec_value)?),
            ApplicationKind::Lambda => KindSpec::Lambda(serde_yaml::from_value(spec_value)?),
            ApplicationKind::Ecs => KindSpec::Ecs(serde_yaml::from_value(spec_value)?),
        };

        Ok(Self {
            api_version: raw.api_version,
            kind,
            generic,
            spec,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, PipedError> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipedError::NotFound(format!(
                    "application config file {} was not found",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&data)
    }

    /// Load the configuration and make sure it declares the expected kind
    pub async fn load_for(path: &Path, expected: ApplicationKind) -> Result<Self, PipedError> {
        let cfg = Self::load(path).await?;
        if cfg.kind != expected {
            return Err(PipedError::Config(format!(
                "application config kind {} does not match the application kind {}",
                cfg.kind, expected
            )));
        }
        Ok(cfg)
    }

    pub fn auto_rollback(&self) -> bool {
        match &self.spec {
            KindSpec::Kubernetes(s) => s.input.auto_rollback,
            KindSpec::Terraform(s) => s.input.auto_rollback,
            KindSpec::CloudRun(s) => s.input.auto_rollback,
            KindSpec::Lambda(s) => s.input.auto_rollback,
            KindSpec::Ecs(s) => s.input.auto_rollback,
        }
    }

    pub fn kubernetes_spec(&self) -> Option<&KubernetesApplicationSpec> {
        match &self.spec {
            KindSpec::Kubernetes(s) => Some(s),
            _ => None,
        }
    }

    pub fn terraform_spec(&self) -> Option<&TerraformApplicationSpec> {
        match &self.spec {
            KindSpec::Terraform(s) => Some(s),
            _ => None,
        }
    }

    pub fn cloudrun_spec(&self) -> Option<&CloudRunApplicationSpec> {
        match &self.spec {
            KindSpec::CloudRun(s) => Some(s),
            _ => None,
        }
    }

    pub fn lambda_spec(&self) -> Option<&LambdaApplicationSpec> {
        match &self.spec {
            KindSpec::Lambda(s) => Some(s),
            _ => None,
        }
    }

    pub fn ecs_spec(&self) -> Option<&EcsApplicationSpec> {
        match &self.spec {
            KindSpec::Ecs(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kubernetes_app() {
        let data = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: canary
  input:
    manifests:
      - deployment.yaml
  workloads:
    - name: helloworld
  planner:
    alwaysUsePipeline: true
  commitMatcher:
    quickSync: "^\\[quick\\]"
  pipeline:
    stages:
      - name: K8S_SYNC
      - name: WAIT
        with:
          duration: 1m
"#;
        let cfg = ApplicationConfig::parse(data).unwrap();
        assert_eq!(cfg.kind, ApplicationKind::Kubernetes);
        assert_eq!(cfg.generic.name, "canary");
        assert!(cfg.generic.planner.always_use_pipeline);
        assert!(cfg.generic.has_pipeline());
        assert!(cfg.auto_rollback());
        let spec = cfg.kubernetes_spec().unwrap();
        assert_eq!(spec.input.manifests, vec!["deployment.yaml".to_string()]);
        assert_eq!(spec.workloads[0].kind, "Deployment");
        assert!(cfg.terraform_spec().is_none());
    }

    #[test]
    fn test_parse_terraform_app() {
        let data = r#"
apiVersion: pipecd.dev/v1beta1
kind: TerraformApp
spec:
  input:
    workspace: dev
    terraformVersion: 1.5.0
    vars:
      - project=demo
    commandFlags:
      plan: ["-refresh=false"]
    autoRollback: false
  encryption:
    encryptedSecrets:
      token: ENCRYPTED
    decryptionTargets:
      - main.tf
"#;
        let cfg = ApplicationConfig::parse(data).unwrap();
        let spec = cfg.terraform_spec().unwrap();
        assert_eq!(spec.input.workspace, "dev");
        assert_eq!(spec.input.command_flags.plan, vec!["-refresh=false".to_string()]);
        assert!(!cfg.auto_rollback());
        assert!(!cfg.generic.has_pipeline());
        let enc = cfg.generic.encryption.as_ref().unwrap();
        assert_eq!(enc.decryption_targets, vec!["main.tf".to_string()]);
    }

    #[test]
    fn test_defaults_and_unknown_kind() {
        let cfg = ApplicationConfig::parse("kind: CloudRunApp\n").unwrap();
        assert_eq!(cfg.cloudrun_spec().unwrap().input.service_manifest_file, "service.yaml");

        assert!(ApplicationConfig::parse("kind: Piped\nspec: {}\n").is_err());
    }
}
