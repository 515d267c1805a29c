//! Commands issued by users through the control plane

use serde::{Deserialize, Serialize};

use crate::model::application::ApplicationKind;
use crate::model::deployment::SyncStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPlanPreview {
    pub repository_id: String,
    pub head_branch: String,
    pub head_commit: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    ApproveStage,
    CancelDeployment,
    BuildPlanPreview(BuildPlanPreview),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default)]
    pub commander: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

/// Per-application outcome of a plan-preview command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPlanPreviewResult {
    pub application_id: String,
    pub application_name: String,
    pub application_kind: Option<ApplicationKind>,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    #[serde(default)]
    pub plan_summary: String,
    #[serde(default)]
    pub plan_details: String,
    #[serde(default)]
    pub no_change: bool,
    #[serde(default)]
    pub error: String,
}

impl ApplicationPlanPreviewResult {
    pub fn failed(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Whole outcome of a plan-preview command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPreviewCommandResult {
    pub command_id: String,
    pub piped_id: String,
    #[serde(default)]
    pub results: Vec<ApplicationPlanPreviewResult>,

    /// Set when the command failed as a whole, e.g. on merge conflicts
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_serde() {
        let json = r#"{
            "id": "cmd-1",
            "deploymentId": "dep-1",
            "stageId": "stage-1",
            "commander": "alice",
            "kind": { "type": "APPROVE_STAGE" }
        }"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.kind, CommandKind::ApproveStage);
        assert_eq!(cmd.commander, "alice");

        let json = r#"{
            "id": "cmd-2",
            "kind": {
                "type": "BUILD_PLAN_PREVIEW",
                "repositoryId": "repo-1",
                "headBranch": "feature",
                "headCommit": "abc",
                "baseBranch": "main"
            }
        }"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd.kind {
            CommandKind::BuildPlanPreview(p) => assert_eq!(p.base_branch, "main"),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
