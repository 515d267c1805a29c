//! Control-plane API consumed by piped components

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipedError;
use crate::http::client::HttpClient;
use crate::model::{
    Application, ApplicationSyncState, ArtifactVersion, Command, CommandStatus, Deployment,
    DeploymentStatus, LogBlock, PipelineStage, StageStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlannedReport {
    pub deployment_id: String,
    pub summary: String,
    pub status_reason: String,
    pub running_commit_hash: String,
    pub running_config_filename: String,
    pub version: String,
    pub versions: Vec<ArtifactVersion>,
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCompletedReport {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub status_reason: String,
    pub stage_statuses: HashMap<String, StageStatus>,
    pub completed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatusReport {
    pub deployment_id: String,
    pub stage_id: String,
    pub status: StageStatus,
    pub status_reason: String,
    pub requires: Vec<String>,
    pub visible: bool,
    pub retried_count: u32,
    pub completed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHandledReport {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// Operations of the control plane piped depends on
#[async_trait]
pub trait PipedApi: Send + Sync {
    async fn list_applications(&self) -> Result<Vec<Application>, PipedError>;

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError>;

    /// `Ok(None)` when the application was never deployed successfully
    async fn get_most_recent_successful_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, PipedError>;

    async fn report_deployment_planned(&self, report: &DeploymentPlannedReport) -> Result<(), PipedError>;

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
    ) -> Result<(), PipedError>;

    async fn report_deployment_completed(&self, report: &DeploymentCompletedReport) -> Result<(), PipedError>;

    async fn report_stage_status_changed(&self, report: &StageStatusReport) -> Result<(), PipedError>;

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError>;

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError>;

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
        blocks: &[LogBlock],
    ) -> Result<(), PipedError>;

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: &ApplicationSyncState,
    ) -> Result<(), PipedError>;

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError>;

    async fn report_command_handled(&self, report: &CommandHandledReport) -> Result<(), PipedError>;
}

#[derive(Debug, Deserialize)]
struct ApplicationListResponse {
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct DeploymentListResponse {
    deployments: Vec<Deployment>,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    deployment: Deployment,
}

#[derive(Debug, Deserialize)]
struct CommandListResponse {
    commands: Vec<Command>,
}

#[async_trait]
impl PipedApi for HttpClient {
    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        let response: ApplicationListResponse = self.get("/piped/applications").await?;
        Ok(response.applications)
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        let response: DeploymentListResponse =
            self.get("/piped/deployments?notCompleted=true").await?;
        Ok(response.deployments)
    }

    async fn get_most_recent_successful_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, PipedError> {
        let path = format!(
            "/piped/applications/{}/deployments/most-recent-successful",
            application_id
        );
        match self.get::<DeploymentResponse>(&path).await {
            Ok(response) => Ok(Some(response.deployment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn report_deployment_planned(&self, report: &DeploymentPlannedReport) -> Result<(), PipedError> {
        let path = format!("/piped/deployments/{}/planned", report.deployment_id);
        let _: serde_json::Value = self.post(&path, report).await?;
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
    ) -> Result<(), PipedError> {
        let path = format!("/piped/deployments/{}/status", deployment_id);
        let body = serde_json::json!({
            "status": status,
            "statusReason": status_reason,
        });
        let _: serde_json::Value = self.patch(&path, &body).await?;
        Ok(())
    }

    async fn report_deployment_completed(&self, report: &DeploymentCompletedReport) -> Result<(), PipedError> {
        let path = format!("/piped/deployments/{}/completed", report.deployment_id);
        let _: serde_json::Value = self.post(&path, report).await?;
        Ok(())
    }

    async fn report_stage_status_changed(&self, report: &StageStatusReport) -> Result<(), PipedError> {
        let path = format!(
            "/piped/deployments/{}/stages/{}/status",
            report.deployment_id, report.stage_id
        );
        let _: serde_json::Value = self.patch(&path, report).await?;
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError> {
        let path = format!("/piped/deployments/{}/metadata", deployment_id);
        let _: serde_json::Value = self.put(&path, metadata).await?;
        Ok(())
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError> {
        let path = format!(
            "/piped/deployments/{}/stages/{}/metadata",
            deployment_id, stage_id
        );
        let _: serde_json::Value = self.put(&path, metadata).await?;
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
        blocks: &[LogBlock],
    ) -> Result<(), PipedError> {
        let path = format!(
            "/piped/deployments/{}/stages/{}/logs",
            deployment_id, stage_id
        );
        let body = serde_json::json!({
            "retriedCount": retried_count,
            "blocks": blocks,
        });
        let _: serde_json::Value = self.post(&path, &body).await?;
        Ok(())
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: &ApplicationSyncState,
    ) -> Result<(), PipedError> {
        let path = format!("/piped/applications/{}/sync-state", application_id);
        let _: serde_json::Value = self.put(&path, state).await?;
        Ok(())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError> {
        let response: CommandListResponse = self.get("/piped/commands?unhandled=true").await?;
        Ok(response.commands)
    }

    async fn report_command_handled(&self, report: &CommandHandledReport) -> Result<(), PipedError> {
        let path = format!("/piped/commands/{}/handled", report.command_id);
        let _: serde_json::Value = self.post(&path, report).await?;
        Ok(())
    }
}
