//! Application models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default name of the application configuration file
pub const DEFAULT_APPLICATION_CONFIG_FILENAME: &str = "app.pipecd.yaml";

/// Kind of runtime an application is deployed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ApplicationKind {
    #[default]
    #[serde(rename = "KUBERNETES")]
    Kubernetes,
    #[serde(rename = "TERRAFORM")]
    Terraform,
    #[serde(rename = "CLOUDRUN")]
    CloudRun,
    #[serde(rename = "LAMBDA")]
    Lambda,
    #[serde(rename = "ECS")]
    Ecs,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationKind::Kubernetes => "KUBERNETES",
            ApplicationKind::Terraform => "TERRAFORM",
            ApplicationKind::CloudRun => "CLOUDRUN",
            ApplicationKind::Lambda => "LAMBDA",
            ApplicationKind::Ecs => "ECS",
        }
    }

    pub fn all() -> [ApplicationKind; 5] {
        [
            ApplicationKind::Kubernetes,
            ApplicationKind::Terraform,
            ApplicationKind::CloudRun,
            ApplicationKind::Lambda,
            ApplicationKind::Ecs,
        ]
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "KUBERNETES" => Ok(ApplicationKind::Kubernetes),
            "TERRAFORM" => Ok(ApplicationKind::Terraform),
            "CLOUDRUN" => Ok(ApplicationKind::CloudRun),
            "LAMBDA" => Ok(ApplicationKind::Lambda),
            "ECS" => Ok(ApplicationKind::Ecs),
            _ => Err(format!("Unknown application kind: {}", s)),
        }
    }
}

/// Repository an application lives in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRepo {
    pub id: String,
    pub remote: String,
    pub branch: String,
}

/// Location of an application inside its repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationGitPath {
    pub repo: ApplicationRepo,

    /// Directory of the application relative to the repository root
    pub path: String,

    /// Name of the application configuration file inside `path`
    #[serde(default)]
    pub config_filename: String,

    #[serde(default)]
    pub url: String,
}

impl ApplicationGitPath {
    /// Relative path of the application configuration file
    pub fn config_file_path(&self) -> String {
        let filename = if self.config_filename.is_empty() {
            DEFAULT_APPLICATION_CONFIG_FILENAME
        } else {
            self.config_filename.as_str()
        };
        let dir = self.path.trim_end_matches('/');
        if dir.is_empty() || dir == "." {
            filename.to_string()
        } else {
            format!("{}/{}", dir, filename)
        }
    }
}

/// An application registered in the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,

    /// Name of the platform provider binding this application to a runtime
    #[serde(default)]
    pub platform_provider: String,

    #[serde(default)]
    pub piped_id: String,

    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub env: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub disabled: bool,
}

/// Whether the live state matches the one declared in Git
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    Unknown,
    Synced,
    OutOfSync,
    Deploying,
}

/// Sync state reported by the drift detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    #[serde(default)]
    pub short_reason: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub head_deployment_id: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_path() {
        let mut git_path = ApplicationGitPath {
            path: "apps/hello/".to_string(),
            ..Default::default()
        };
        assert_eq!(git_path.config_file_path(), "apps/hello/app.pipecd.yaml");

        git_path.config_filename = "service.pipecd.yaml".to_string();
        assert_eq!(git_path.config_file_path(), "apps/hello/service.pipecd.yaml");

        git_path.path = ".".to_string();
        assert_eq!(git_path.config_file_path(), "service.pipecd.yaml");
    }

    #[test]
    fn test_application_kind_serde() {
        let kind: ApplicationKind = serde_json::from_str("\"CLOUDRUN\"").unwrap();
        assert_eq!(kind, ApplicationKind::CloudRun);
        assert_eq!("ecs".parse::<ApplicationKind>().unwrap(), ApplicationKind::Ecs);
    }
}
