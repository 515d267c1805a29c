//! Pipeline stage models

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of stage names a pipeline may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageName {
    #[serde(rename = "WAIT")]
    Wait,
    #[serde(rename = "WAIT_APPROVAL")]
    WaitApproval,
    #[serde(rename = "ANALYSIS")]
    Analysis,
    #[serde(rename = "SCRIPT_RUN")]
    ScriptRun,
    #[serde(rename = "CUSTOM_SYNC")]
    CustomSync,
    #[serde(rename = "CUSTOM_SYNC_ROLLBACK")]
    CustomSyncRollback,
    #[serde(rename = "ROLLBACK")]
    Rollback,
    #[serde(rename = "K8S_SYNC")]
    K8sSync,
    #[serde(rename = "CLOUDRUN_SYNC")]
    CloudRunSync,
    #[serde(rename = "CLOUDRUN_PROMOTE")]
    CloudRunPromote,
    #[serde(rename = "TERRAFORM_SYNC")]
    TerraformSync,
    #[serde(rename = "TERRAFORM_PLAN")]
    TerraformPlan,
    #[serde(rename = "TERRAFORM_APPLY")]
    TerraformApply,
    #[serde(rename = "LAMBDA_SYNC")]
    LambdaSync,
    #[serde(rename = "LAMBDA_PROMOTE")]
    LambdaPromote,
    #[serde(rename = "LAMBDA_CANARY_ROLLOUT")]
    LambdaCanaryRollout,
    #[serde(rename = "ECS_SYNC")]
    EcsSync,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Wait => "WAIT",
            StageName::WaitApproval => "WAIT_APPROVAL",
            StageName::Analysis => "ANALYSIS",
            StageName::ScriptRun => "SCRIPT_RUN",
            StageName::CustomSync => "CUSTOM_SYNC",
            StageName::CustomSyncRollback => "CUSTOM_SYNC_ROLLBACK",
            StageName::Rollback => "ROLLBACK",
            StageName::K8sSync => "K8S_SYNC",
            StageName::CloudRunSync => "CLOUDRUN_SYNC",
            StageName::CloudRunPromote => "CLOUDRUN_PROMOTE",
            StageName::TerraformSync => "TERRAFORM_SYNC",
            StageName::TerraformPlan => "TERRAFORM_PLAN",
            StageName::TerraformApply => "TERRAFORM_APPLY",
            StageName::LambdaSync => "LAMBDA_SYNC",
            StageName::LambdaPromote => "LAMBDA_PROMOTE",
            StageName::LambdaCanaryRollout => "LAMBDA_CANARY_ROLLOUT",
            StageName::EcsSync => "ECS_SYNC",
        }
    }

    /// Whether the stage belongs to the rollback path of a pipeline
    pub fn is_rollback(&self) -> bool {
        matches!(self, StageName::Rollback | StageName::CustomSyncRollback)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Unknown stage name: {}", s))
    }
}

/// Status of a single pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    NotStartedYet,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
    Exited,
}

impl StageStatus {
    /// Whether the stage will never be re-entered
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            StageStatus::Success
                | StageStatus::Failure
                | StageStatus::Cancelled
                | StageStatus::Skipped
                | StageStatus::Exited
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::NotStartedYet => "NOT_STARTED_YET",
            StageStatus::Running => "RUNNING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Failure => "FAILURE",
            StageStatus::Cancelled => "CANCELLED",
            StageStatus::Skipped => "SKIPPED",
            StageStatus::Exited => "EXITED",
        };
        f.write_str(s)
    }
}

/// A stage of a deployment pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub id: String,
    pub name: StageName,
    #[serde(default)]
    pub desc: String,
    pub index: u32,

    /// Whether the stage was generated by piped rather than declared by the user
    #[serde(default)]
    pub predefined: bool,

    /// Ids of the stages that must complete before this one
    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default = "default_visible")]
    pub visible: bool,

    #[serde(default)]
    pub rollback: bool,

    #[serde(default)]
    pub status: StageStatus,

    #[serde(default)]
    pub status_reason: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub retried_count: u32,

    #[serde(default)]
    pub completed_at: i64,

    #[serde(default)]
    pub created_at: i64,

    #[serde(default)]
    pub updated_at: i64,
}

fn default_visible() -> bool {
    true
}

impl PipelineStage {
    pub fn new(id: impl Into<String>, name: StageName, index: u32, now: i64) -> Self {
        Self {
            id: id.into(),
            name,
            desc: String::new(),
            index,
            predefined: false,
            requires: Vec::new(),
            visible: true,
            rollback: false,
            status: StageStatus::NotStartedYet,
            status_reason: String::new(),
            metadata: HashMap::new(),
            retried_count: 0,
            completed_at: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
