//! In-memory control plane, used for dry runs and tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::PipedError;
use crate::http::api::{
    CommandHandledReport, DeploymentCompletedReport, DeploymentPlannedReport, PipedApi,
    StageStatusReport,
};
use crate::model::{
    Application, ApplicationSyncState, Command, Deployment, DeploymentStatus, LogBlock,
};

#[derive(Default)]
struct State {
    applications: Vec<Application>,
    deployments: Vec<Deployment>,
    most_recent_successful: HashMap<String, Deployment>,
    commands: Vec<Command>,

    planned: Vec<DeploymentPlannedReport>,
    status_changes: Vec<(String, DeploymentStatus, String)>,
    completed: Vec<DeploymentCompletedReport>,
    stage_reports: Vec<StageStatusReport>,
    deployment_metadata: HashMap<String, HashMap<String, String>>,
    stage_metadata: HashMap<(String, String), HashMap<String, String>>,
    stage_logs: HashMap<(String, String), Vec<LogBlock>>,
    sync_states: HashMap<String, ApplicationSyncState>,
    handled_commands: Vec<CommandHandledReport>,
}

/// Keeps every report in memory. Unknown lookups return empty results.
#[derive(Default)]
pub struct InMemoryApi {
    state: Mutex<State>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Result<R, PipedError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipedError::Internal("in-memory api state poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    pub fn add_application(&self, app: Application) -> Result<(), PipedError> {
        self.with_state(|s| s.applications.push(app))
    }

    pub fn add_deployment(&self, deployment: Deployment) -> Result<(), PipedError> {
        self.with_state(|s| s.deployments.push(deployment))
    }

    pub fn set_most_recent_successful(&self, deployment: Deployment) -> Result<(), PipedError> {
        self.with_state(|s| {
            s.most_recent_successful
                .insert(deployment.application_id.clone(), deployment);
        })
    }

    pub fn push_command(&self, command: Command) -> Result<(), PipedError> {
        self.with_state(|s| s.commands.push(command))
    }

    pub fn planned_reports(&self) -> Vec<DeploymentPlannedReport> {
        self.with_state(|s| s.planned.clone()).unwrap_or_default()
    }

    pub fn status_changes(&self) -> Vec<(String, DeploymentStatus, String)> {
        self.with_state(|s| s.status_changes.clone()).unwrap_or_default()
    }

    pub fn completed_reports(&self) -> Vec<DeploymentCompletedReport> {
        self.with_state(|s| s.completed.clone()).unwrap_or_default()
    }

    pub fn stage_reports(&self) -> Vec<StageStatusReport> {
        self.with_state(|s| s.stage_reports.clone()).unwrap_or_default()
    }

    pub fn deployment_metadata(&self, deployment_id: &str) -> HashMap<String, String> {
        self.with_state(|s| {
            s.deployment_metadata
                .get(deployment_id)
                .cloned()
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn stage_metadata(&self, deployment_id: &str, stage_id: &str) -> HashMap<String, String> {
        self.with_state(|s| {
            s.stage_metadata
                .get(&(deployment_id.to_string(), stage_id.to_string()))
                .cloned()
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn stage_logs(&self, deployment_id: &str, stage_id: &str) -> Vec<LogBlock> {
        self.with_state(|s| {
            s.stage_logs
                .get(&(deployment_id.to_string(), stage_id.to_string()))
                .cloned()
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn sync_state(&self, application_id: &str) -> Option<ApplicationSyncState> {
        self.with_state(|s| s.sync_states.get(application_id).cloned())
            .ok()
            .flatten()
    }

    pub fn handled_commands(&self) -> Vec<CommandHandledReport> {
        self.with_state(|s| s.handled_commands.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PipedApi for InMemoryApi {
    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        self.with_state(|s| s.applications.clone())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        self.with_state(|s| {
            s.deployments
                .iter()
                .filter(|d| !d.status.is_completed())
                .cloned()
                .collect()
        })
    }

    async fn get_most_recent_successful_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, PipedError> {
        self.with_state(|s| s.most_recent_successful.get(application_id).cloned())
    }

    async fn report_deployment_planned(&self, report: &DeploymentPlannedReport) -> Result<(), PipedError> {
        self.with_state(|s| {
            if let Some(d) = s
                .deployments
                .iter_mut()
                .find(|d| d.id == report.deployment_id)
            {
                d.status = DeploymentStatus::Planned;
                d.stages = report.stages.clone();
                d.summary = report.summary.clone();
                d.running_commit_hash = report.running_commit_hash.clone();
                d.running_config_filename = report.running_config_filename.clone();
                d.version = report.version.clone();
                d.versions = report.versions.clone();
            }
            s.planned.push(report.clone());
        })
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
    ) -> Result<(), PipedError> {
        self.with_state(|s| {
            if let Some(d) = s.deployments.iter_mut().find(|d| d.id == deployment_id) {
                d.status = status;
                d.status_reason = status_reason.to_string();
            }
            s.status_changes
                .push((deployment_id.to_string(), status, status_reason.to_string()));
        })
    }

    async fn report_deployment_completed(&self, report: &DeploymentCompletedReport) -> Result<(), PipedError> {
        self.with_state(|s| {
            if let Some(d) = s
                .deployments
                .iter_mut()
                .find(|d| d.id == report.deployment_id)
            {
                d.status = report.status;
                d.status_reason = report.status_reason.clone();
            }
            s.completed.push(report.clone());
        })
    }

    async fn report_stage_status_changed(&self, report: &StageStatusReport) -> Result<(), PipedError> {
        self.with_state(|s| {
            let stage = s
                .deployments
                .iter_mut()
                .find(|d| d.id == report.deployment_id)
                .and_then(|d| d.stage_mut(&report.stage_id));
            if let Some(stage) = stage {
                stage.status = report.status;
                stage.status_reason = report.status_reason.clone();
                stage.visible = report.visible;
            }
            s.stage_reports.push(report.clone());
        })
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError> {
        self.with_state(|s| {
            s.deployment_metadata
                .entry(deployment_id.to_string())
                .or_default()
                .extend(metadata.clone());
        })
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), PipedError> {
        self.with_state(|s| {
            s.stage_metadata
                .entry((deployment_id.to_string(), stage_id.to_string()))
                .or_default()
                .extend(metadata.clone());
        })
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        _retried_count: u32,
        blocks: &[LogBlock],
    ) -> Result<(), PipedError> {
        self.with_state(|s| {
            s.stage_logs
                .entry((deployment_id.to_string(), stage_id.to_string()))
                .or_default()
                .extend_from_slice(blocks);
        })
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: &ApplicationSyncState,
    ) -> Result<(), PipedError> {
        self.with_state(|s| {
            s.sync_states
                .insert(application_id.to_string(), state.clone());
        })
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError> {
        self.with_state(|s| {
            let handled: Vec<&str> = s
                .handled_commands
                .iter()
                .map(|c| c.command_id.as_str())
                .collect();
            s.commands
                .iter()
                .filter(|c| !handled.contains(&c.id.as_str()))
                .cloned()
                .collect()
        })
    }

    async fn report_command_handled(&self, report: &CommandHandledReport) -> Result<(), PipedError> {
        self.with_state(|s| s.handled_commands.push(report.clone()))
    }
}
