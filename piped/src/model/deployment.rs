//! Deployment models

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::application::{ApplicationGitPath, ApplicationKind};
use crate::model::artifact::ArtifactVersion;
use crate::model::stage::PipelineStage;

/// Strategy chosen (or forced) for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    /// Let the planner decide
    #[default]
    Auto,
    QuickSync,
    Pipeline,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStrategy::Auto => "AUTO",
            SyncStrategy::QuickSync => "QUICK_SYNC",
            SyncStrategy::Pipeline => "PIPELINE",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }
}

/// Git commit that triggered a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub created_at: i64,
}

/// What caused the deployment to exist
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTrigger {
    pub commit: Commit,

    /// Login of the user who triggered the deployment manually, empty for commits
    #[serde(default)]
    pub commander: String,

    #[serde(default)]
    pub timestamp: i64,

    #[serde(default)]
    pub sync_strategy: SyncStrategy,

    #[serde(default)]
    pub strategy_summary: String,
}

/// An attempt to reconcile an application to a target commit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub piped_id: String,
    #[serde(default)]
    pub project_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    #[serde(default)]
    pub platform_provider: String,
    pub trigger: DeploymentTrigger,

    /// Commit of the last successful deployment, empty when this is the first one
    #[serde(default)]
    pub running_commit_hash: String,

    #[serde(default)]
    pub running_config_filename: String,

    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,

    #[serde(default)]
    pub stages: Vec<PipelineStage>,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub versions: Vec<ArtifactVersion>,

    /// Deployment-shared metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub completed_at: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Deployment {
    /// Commit the deployment reconciles to
    pub fn target_commit_hash(&self) -> &str {
        &self.trigger.commit.hash
    }

    pub fn stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut PipelineStage> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    /// Rollback stages appended by the planner
    pub fn rollback_stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages.iter().filter(|s| s.rollback)
    }
}
