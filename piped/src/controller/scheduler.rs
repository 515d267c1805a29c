//! Runs the stages of one deployment
//!
//! The scheduler walks the forward stages in order, reporting every status
//! change to the control plane. A failed or cancelled deployment then runs
//! its rollback stages. When piped shuts down in the middle, nothing is
//! reported as completed so the next piped process resumes the deployment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::app::state::AppState;
use crate::config::application::ApplicationConfig;
use crate::config::stage::{PipelineStageConfig, SkipOptions};
use crate::deploysource::Provider;
use crate::errors::PipedError;
use crate::executor::{
    self, check_skip, determine_stage_status, new_stop_signal, ApiCommandLister, MetadataStore,
    StageLogPersister, StopSignal, StopSignalKind,
};
use crate::http::{CommandHandledReport, DeploymentCompletedReport, StageStatusReport};
use crate::logs::{StageLogWriter, TracingLogWriter};
use crate::model::{
    CommandKind, CommandStatus, Deployment, DeploymentStatus, PipelineStage, StageStatus,
};
use crate::utils::{now_unix, Retry};

const REPORT_RETRIES: u32 = 10;
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct Scheduler {
    deployment: Deployment,
    state: Arc<AppState>,
    working_dir: PathBuf,
    target_ds: Arc<dyn Provider>,
    running_ds: Option<Arc<dyn Provider>>,
    metadata: MetadataStore,
    cancel_check_interval: Duration,
    /// Files changed since the running commit, resolved on first use
    changed_files: Option<Vec<String>>,
}

impl Scheduler {
    pub fn new(deployment: Deployment, state: Arc<AppState>) -> Result<Self, PipedError> {
        let working_dir = state.piped.working_dir.join("deployments").join(&deployment.id);
        let target_ds = state.source_provider(
            &working_dir.join("target"),
            &deployment.git_path,
            deployment.kind,
            "target",
            deployment.target_commit_hash(),
        )?;
        let running_ds = if deployment.running_commit_hash.is_empty() {
            None
        } else {
            let mut git_path = deployment.git_path.clone();
            if !deployment.running_config_filename.is_empty() {
                git_path.config_filename = deployment.running_config_filename.clone();
            }
            Some(state.source_provider(
                &working_dir.join("running"),
                &git_path,
                deployment.kind,
                "running",
                &deployment.running_commit_hash,
            )?)
        };
        let metadata = MetadataStore::new(state.api.clone(), &deployment);
        Ok(Self {
            deployment,
            state,
            working_dir,
            target_ds,
            running_ds,
            metadata,
            cancel_check_interval: CANCEL_CHECK_INTERVAL,
            changed_files: None,
        })
    }

    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment.id
    }

    /// Run the deployment until it completes or `shutdown` fires. Returns the
    /// status the deployment was left in.
    pub async fn run(mut self, shutdown: StopSignal) -> DeploymentStatus {
        info!("Start running deployment {} of application {}", self.deployment.id, self.deployment.application_id);

        if self.deployment.status == DeploymentStatus::Planned {
            let reason = "The piped started handling this deployment";
            if let Err(e) = self.report_status(DeploymentStatus::Running, reason).await {
                error!("Failed to report running status of deployment {}: {}", self.deployment.id, e);
            }
            self.deployment.status = DeploymentStatus::Running;
        }

        let lw = TracingLogWriter::new(format!("scheduler/{}", self.deployment.id));
        let app_config = match self.target_ds.get_readonly(&lw).await {
            Ok(ds) => ds.config.clone(),
            Err(e) => {
                let reason = format!("Unable to prepare the target deploy source ({})", e);
                return self.complete(DeploymentStatus::Failure, reason).await;
            }
        };

        let timeout = app_config.generic.timeout.unwrap_or(self.state.piped.deployment_timeout);
        let (handler, sig) = new_stop_signal();
        let (last_stage, forward_status) = {
            let watcher = watch_deployment(
                self.state.clone(),
                self.deployment.id.clone(),
                shutdown.clone(),
                timeout,
                self.cancel_check_interval,
                handler,
            );
            tokio::pin!(watcher);
            let forward = self.run_forward_stages(&app_config, &sig);
            tokio::pin!(forward);
            let mut watching = true;
            loop {
                tokio::select! {
                    out = &mut forward => break out,
                    _ = &mut watcher, if watching => watching = false,
                }
            }
        };

        let signal = sig.signal();
        if signal == StopSignalKind::Terminate {
            info!("Deployment {} was interrupted by shutdown, it will be resumed later", self.deployment.id);
            return self.deployment.status;
        }

        let (status, reason) = match (signal, forward_status) {
            (StopSignalKind::Cancel, _) | (_, StageStatus::Cancelled) => (
                DeploymentStatus::Cancelled,
                format!("Cancelled while executing stage {}", last_stage),
            ),
            (StopSignalKind::Timeout, _) => (
                DeploymentStatus::Failure,
                format!("Timed out while executing stage {} (timeout: {:?})", last_stage, timeout),
            ),
            (_, StageStatus::Failure) => (
                DeploymentStatus::Failure,
                format!("Failed while executing stage {}", last_stage),
            ),
            _ => (DeploymentStatus::Success, "The deployment was completed successfully".to_string()),
        };

        if status != DeploymentStatus::Success && self.deployment.rollback_stages().next().is_some() {
            if let Err(e) = self.report_status(DeploymentStatus::RollingBack, "Rolling back the deployment").await {
                error!("Failed to report rolling back status of deployment {}: {}", self.deployment.id, e);
            }
            self.deployment.status = DeploymentStatus::RollingBack;
            if self.run_rollback_stages(&app_config, &shutdown).await == StopSignalKind::Terminate {
                info!("Rollback of deployment {} was interrupted by shutdown", self.deployment.id);
                return self.deployment.status;
            }
        }

        self.complete(status, reason).await
    }

    /// Run the forward stages in order. Returns the name of the last stage
    /// run and its status.
    async fn run_forward_stages(&mut self, app_config: &Arc<ApplicationConfig>, sig: &StopSignal) -> (String, StageStatus) {
        let mut stages: Vec<PipelineStage> = self.deployment.stages.iter().filter(|s| !s.rollback).cloned().collect();
        stages.sort_by_key(|s| s.index);

        let mut last = (String::new(), StageStatus::Success);
        for stage in stages {
            if stage.status.is_completed() {
                last = (stage.name.to_string(), stage.status);
                if matches!(stage.status, StageStatus::Failure | StageStatus::Cancelled | StageStatus::Exited) {
                    break;
                }
                continue;
            }
            if sig.is_stopped() {
                break;
            }
            let name = stage.name.to_string();
            let status = self.run_stage(stage, app_config, sig, true).await;
            last = (name, status);
            match status {
                StageStatus::Success | StageStatus::Skipped => continue,
                StageStatus::Exited => {
                    info!("Deployment {} exited early, remaining stages are not run", self.deployment.id);
                    break;
                }
                _ => break,
            }
        }
        last
    }

    /// Run every not completed rollback stage with a signal only shutdown can fire
    async fn run_rollback_stages(&mut self, app_config: &Arc<ApplicationConfig>, shutdown: &StopSignal) -> StopSignalKind {
        let stages: Vec<PipelineStage> = self
            .deployment
            .rollback_stages()
            .filter(|s| !s.status.is_completed())
            .cloned()
            .collect();
        for mut stage in stages {
            if shutdown.is_stopped() {
                break;
            }
            // Rollback stages become visible once they start
            stage.visible = true;
            if let Some(s) = self.deployment.stage_mut(&stage.id) {
                s.visible = true;
            }
            self.run_stage(stage, app_config, shutdown, false).await;
        }
        shutdown.signal()
    }

    async fn run_stage(
        &mut self,
        stage: PipelineStage,
        app_config: &Arc<ApplicationConfig>,
        parent: &StopSignal,
        can_skip: bool,
    ) -> StageStatus {
        let stage_config = if stage.predefined {
            None
        } else {
            app_config
                .generic
                .pipeline
                .as_ref()
                .and_then(|p| p.stage_by_index(stage.index as usize))
                .cloned()
        };

        if can_skip {
            if let Some(options) = stage_config.as_ref().map(|c| c.options.skip_on()) {
                match self.should_skip(options).await {
                    Ok(true) => {
                        info!("Skip stage {} of deployment {}", stage.id, self.deployment.id);
                        self.update_stage(&stage, StageStatus::Skipped, "The stage was skipped").await;
                        return StageStatus::Skipped;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Unable to check whether stage {} should be skipped: {}", stage.id, e),
                }
            }
        }

        let original = stage.status;
        if original != StageStatus::Running {
            self.update_stage(&stage, StageStatus::Running, "").await;
        }

        let log = Arc::new(StageLogPersister::new(
            self.state.api.clone(),
            &self.deployment.id,
            &stage.id,
            stage.retried_count,
        ));
        let input = executor::Input {
            deployment: Arc::new(self.deployment.clone()),
            stage: stage.clone(),
            stage_config: stage_config.clone(),
            app_config: app_config.clone(),
            piped: self.state.piped.clone(),
            target_ds: self.target_ds.clone(),
            running_ds: self.running_ds.clone(),
            api: self.state.api.clone(),
            metadata: self.metadata.clone(),
            log: log.clone(),
            commands: Arc::new(ApiCommandLister::new(self.state.api.clone(), &self.deployment.id, &stage.id)),
            clients: self.state.clients.clone(),
            git_client: self.state.git_client.clone(),
            working_dir: self.working_dir.join("stages").join(&stage.id),
        };

        let status = match self.state.executors.executor(input) {
            Some(executor) => run_with_signal(executor.as_ref(), parent, &stage_config, original).await,
            None => {
                log.error(&format!("No registered executor for stage {}", stage.name));
                StageStatus::Failure
            }
        };

        if let Err(e) = log.flush().await {
            warn!("Failed to flush the logs of stage {}: {}", stage.id, e);
        }
        if status.is_completed() {
            self.update_stage(&stage, status, "").await;
        }
        status
    }

    async fn should_skip(&mut self, options: &SkipOptions) -> Result<bool, PipedError> {
        if options.is_empty() {
            return Ok(false);
        }
        let message = self.deployment.trigger.commit.message.clone();
        let none: [&str; 0] = [];
        if check_skip(options, &none, &message)? {
            return Ok(true);
        }
        if options.paths.is_empty() || self.deployment.running_commit_hash.is_empty() {
            return Ok(false);
        }
        if self.changed_files.is_none() {
            self.changed_files = Some(self.resolve_changed_files().await?);
        }
        let files = self.changed_files.as_deref().unwrap_or_default();
        check_skip(options, files, &message)
    }

    async fn resolve_changed_files(&self) -> Result<Vec<String>, PipedError> {
        let repo_id = &self.deployment.git_path.repo.id;
        let repo_cfg = self
            .state
            .piped
            .repository(repo_id)
            .ok_or_else(|| PipedError::Config(format!("repository {} was not found", repo_id)))?;
        tokio::fs::create_dir_all(&self.working_dir).await?;
        let dir = tempfile::Builder::new().prefix("changes-").tempdir_in(&self.working_dir)?;
        let repo = self
            .state
            .git_client
            .clone_repo(&repo_cfg.id, &repo_cfg.remote, &repo_cfg.branch, &dir.path().join("repo"))
            .await?;
        repo.changed_files(&self.deployment.running_commit_hash, self.deployment.target_commit_hash())
            .await
    }

    async fn update_stage(&mut self, stage: &PipelineStage, status: StageStatus, reason: &str) {
        let completed_at = if status.is_completed() { now_unix() } else { 0 };
        if let Some(s) = self.deployment.stage_mut(&stage.id) {
            s.status = status;
            s.status_reason = reason.to_string();
            s.completed_at = completed_at;
        }
        let report = &StageStatusReport {
            deployment_id: self.deployment.id.clone(),
            stage_id: stage.id.clone(),
            status,
            status_reason: reason.to_string(),
            requires: stage.requires.clone(),
            visible: stage.visible,
            retried_count: stage.retried_count,
            completed_at,
        };
        let api = &self.state.api;
        let result = Retry::exponential(REPORT_RETRIES)
            .run(|| async move { api.report_stage_status_changed(report).await })
            .await;
        if let Err(e) = result {
            error!("Failed to report status {} of stage {}: {}", status, stage.id, e);
        }
    }

    async fn report_status(&self, status: DeploymentStatus, reason: &str) -> Result<(), PipedError> {
        let api = &self.state.api;
        let id = self.deployment.id.as_str();
        Retry::exponential(REPORT_RETRIES)
            .run(|| async move { api.report_deployment_status_changed(id, status, reason).await })
            .await
    }

    async fn complete(mut self, status: DeploymentStatus, reason: String) -> DeploymentStatus {
        let stage_statuses: HashMap<String, StageStatus> =
            self.deployment.stages.iter().map(|s| (s.id.clone(), s.status)).collect();
        let report = &DeploymentCompletedReport {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason,
            stage_statuses,
            completed_at: now_unix(),
        };
        let api = &self.state.api;
        let result = Retry::exponential(REPORT_RETRIES)
            .run(|| async move { api.report_deployment_completed(report).await })
            .await;
        match result {
            Ok(()) => info!("Deployment {} was completed with status {:?}", self.deployment.id, status),
            Err(e) => error!("Failed to report completion of deployment {}: {}", self.deployment.id, e),
        }
        self.deployment.status = status;

        if let Err(e) = tokio::fs::remove_dir_all(&self.working_dir).await {
            debug!("Unable to remove working directory {}: {}", self.working_dir.display(), e);
        }
        status
    }
}

/// Drive an executor, stopping it on the parent signal or the stage timeout
async fn run_with_signal(
    executor: &dyn executor::Executor,
    parent: &StopSignal,
    stage_config: &Option<PipelineStageConfig>,
    original: StageStatus,
) -> StageStatus {
    let (handler, sig) = new_stop_signal();
    let timeout = stage_config.as_ref().and_then(|c| c.timeout);
    let forward = async {
        match timeout {
            Some(timeout) => {
                tokio::select! {
                    kind = parent.wait() => handler.send(kind),
                    _ = tokio::time::sleep(timeout) => handler.send(StopSignalKind::Timeout),
                }
            }
            None => handler.send(parent.wait().await),
        }
    };
    tokio::pin!(forward);

    let exec = executor.execute(&sig);
    tokio::pin!(exec);
    let mut forwarding = true;
    let got = loop {
        tokio::select! {
            status = &mut exec => break status,
            _ = &mut forward, if forwarding => forwarding = false,
        }
    };
    determine_stage_status(sig.signal(), original, got)
}

/// Fire `handler` on shutdown, on the deployment timeout or when the user
/// cancels the deployment.
async fn watch_deployment(
    state: Arc<AppState>,
    deployment_id: String,
    shutdown: StopSignal,
    timeout: Duration,
    check_interval: Duration,
    handler: executor::StopSignalHandler,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                handler.send(StopSignalKind::Terminate);
                return;
            }
            _ = &mut deadline => {
                info!("Deployment {} timed out after {:?}", deployment_id, timeout);
                handler.send(StopSignalKind::Timeout);
                return;
            }
            _ = tokio::time::sleep(check_interval) => {
                if cancel_requested(&state, &deployment_id).await {
                    handler.send(StopSignalKind::Cancel);
                    return;
                }
            }
        }
    }
}

async fn cancel_requested(state: &AppState, deployment_id: &str) -> bool {
    let commands = match state.api.list_unhandled_commands().await {
        Ok(commands) => commands,
        Err(e) => {
            warn!("Failed to list commands of deployment {}: {}", deployment_id, e);
            return false;
        }
    };
    let Some(cmd) = commands
        .into_iter()
        .find(|c| c.deployment_id == deployment_id && matches!(c.kind, CommandKind::CancelDeployment))
    else {
        return false;
    };
    info!("Deployment {} was cancelled by {}", deployment_id, cmd.commander);
    let report = CommandHandledReport {
        command_id: cmd.id.clone(),
        status: CommandStatus::Succeeded,
        metadata: HashMap::new(),
        output: None,
    };
    if let Err(e) = state.api.report_command_handled(&report).await {
        error!("Failed to report command {} as handled: {}", cmd.id, e);
    }
    true
}

#[cfg(test)]
pub(crate) mod testing {
    //! Executors whose outcome is decided by the test

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::executor::{status_on_stop, Executor, Factory, Registry};
    use crate::model::{ApplicationKind, StageName};

    /// Stage ids in the order they were run
    pub type Calls = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        stage_id: String,
        status: Option<StageStatus>,
        calls: Calls,
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn execute(&self, sig: &StopSignal) -> StageStatus {
            self.calls.lock().unwrap().push(self.stage_id.clone());
            match self.status {
                Some(status) => status,
                // Run until stopped
                None => status_on_stop(sig.wait().await, StageStatus::Running),
            }
        }
    }

    /// Registry whose K8S_SYNC and Kubernetes ROLLBACK executors return the
    /// status mapped to the stage id. Unmapped stages succeed, `None` blocks
    /// until the stage is stopped.
    pub fn registry(outcomes: &[(&str, Option<StageStatus>)], calls: Calls) -> Registry {
        let outcomes: HashMap<String, Option<StageStatus>> =
            outcomes.iter().map(|(id, s)| (id.to_string(), *s)).collect();
        let factory: Factory = Arc::new(move |input: executor::Input| {
            let status = outcomes
                .get(&input.stage.id)
                .copied()
                .unwrap_or(Some(StageStatus::Success));
            Box::new(Scripted {
                stage_id: input.stage.id.clone(),
                status,
                calls: calls.clone(),
            })
        });
        let mut r = Registry::new();
        r.register(StageName::K8sSync, factory.clone()).unwrap();
        r.register_rollback(ApplicationKind::Kubernetes, factory).unwrap();
        r
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::{registry, Calls};
    use super::*;
    use crate::app::state::testing::state;
    use crate::executor::StopSignalHandler;
    use crate::git::testing::DirGitClient;
    use crate::http::InMemoryApi;
    use crate::model::{ApplicationKind, Command, StageName};
    use crate::planner::testing::write_app;

    const APP: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_SYNC
        with:
          skipOn:
            commitMessagePrefix: "[skip-sync]"
      - name: K8S_SYNC
"#;

    fn deployment() -> Deployment {
        let mut d = crate::executor::testing::deployment(ApplicationKind::Kubernetes);
        d.status = DeploymentStatus::Planned;
        d.running_commit_hash = "fedcba9876543210".to_string();
        let mut stages = vec![
            PipelineStage::new("stage-0", StageName::K8sSync, 0, 0),
            PipelineStage::new("stage-1", StageName::K8sSync, 1, 0),
            PipelineStage::new("rollback", StageName::Rollback, 2, 0),
        ];
        stages[1].requires = vec!["stage-0".to_string()];
        stages[2].predefined = true;
        stages[2].rollback = true;
        stages[2].visible = false;
        d.stages = stages;
        d
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
        api: Arc<InMemoryApi>,
        calls: Calls,
    }

    async fn fixture(outcomes: &[(&str, Option<StageStatus>)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_app(&repo, &[("app.pipecd.yaml", APP)]).await;
        let git = DirGitClient {
            src: repo,
            ..Default::default()
        };
        let (mut state, api) = state(dir.path(), git).await;
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        state.executors = Arc::new(registry(outcomes, calls.clone()));
        Fixture {
            _dir: dir,
            state: Arc::new(state),
            api,
            calls,
        }
    }

    fn run(f: &Fixture, d: Deployment) -> (StopSignalHandler, tokio::task::JoinHandle<DeploymentStatus>) {
        f.api.add_deployment(d.clone()).unwrap();
        let scheduler = Scheduler::new(d, f.state.clone())
            .unwrap()
            .with_cancel_check_interval(Duration::from_millis(10));
        let (handler, shutdown) = new_stop_signal();
        (handler, tokio::spawn(scheduler.run(shutdown)))
    }

    fn calls(f: &Fixture) -> Vec<String> {
        f.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_successful_deployment() {
        let f = fixture(&[]).await;
        let (_handler, handle) = run(&f, deployment());

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Success);
        assert_eq!(calls(&f), ["stage-0", "stage-1"]);

        let changes = f.api.status_changes();
        assert_eq!(changes[0].1, DeploymentStatus::Running);
        let completed = f.api.completed_reports();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, DeploymentStatus::Success);
        assert_eq!(completed[0].stage_statuses["stage-1"], StageStatus::Success);
        assert_eq!(completed[0].stage_statuses["rollback"], StageStatus::NotStartedYet);

        let statuses: Vec<(String, StageStatus)> = f
            .api
            .stage_reports()
            .into_iter()
            .map(|r| (r.stage_id, r.status))
            .collect();
        assert_eq!(
            statuses,
            [
                ("stage-0".to_string(), StageStatus::Running),
                ("stage-0".to_string(), StageStatus::Success),
                ("stage-1".to_string(), StageStatus::Running),
                ("stage-1".to_string(), StageStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_runs_rollback() {
        let f = fixture(&[("stage-0", Some(StageStatus::Failure))]).await;
        let (_handler, handle) = run(&f, deployment());

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Failure);
        assert_eq!(calls(&f), ["stage-0", "rollback"]);
        assert!(f
            .api
            .status_changes()
            .iter()
            .any(|(_, status, _)| *status == DeploymentStatus::RollingBack));
        let completed = &f.api.completed_reports()[0];
        assert_eq!(completed.status, DeploymentStatus::Failure);
        assert_eq!(completed.stage_statuses["stage-1"], StageStatus::NotStartedYet);
        assert_eq!(completed.stage_statuses["rollback"], StageStatus::Success);
        let rollback_report = f
            .api
            .stage_reports()
            .into_iter()
            .find(|r| r.stage_id == "rollback")
            .unwrap();
        assert!(rollback_report.visible);
    }

    #[tokio::test]
    async fn test_skip_on_commit_message_prefix() {
        let f = fixture(&[]).await;
        let mut d = deployment();
        d.trigger.commit.message = "[skip-sync] docs only".to_string();
        let (_handler, handle) = run(&f, d);

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Success);
        assert_eq!(calls(&f), ["stage-1"]);
        let completed = &f.api.completed_reports()[0];
        assert_eq!(completed.stage_statuses["stage-0"], StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_command_stops_the_deployment() {
        let f = fixture(&[("stage-0", None)]).await;
        f.api
            .push_command(Command {
                id: "cmd-1".to_string(),
                application_id: "app-1".to_string(),
                deployment_id: "dep-1".to_string(),
                stage_id: String::new(),
                commander: "alice".to_string(),
                kind: CommandKind::CancelDeployment,
                created_at: 0,
            })
            .unwrap();
        let (_handler, handle) = run(&f, deployment());

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Cancelled);
        assert_eq!(calls(&f), ["stage-0", "rollback"]);
        let completed = &f.api.completed_reports()[0];
        assert_eq!(completed.stage_statuses["stage-0"], StageStatus::Cancelled);
        assert_eq!(f.api.handled_commands()[0].command_id, "cmd-1");
    }

    #[tokio::test]
    async fn test_shutdown_leaves_deployment_resumable() {
        let f = fixture(&[("stage-0", None)]).await;
        let (handler, handle) = run(&f, deployment());

        while calls(&f).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handler.send(StopSignalKind::Terminate);

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Running);
        assert!(f.api.completed_reports().is_empty());
        assert_eq!(calls(&f), ["stage-0"]);
        let last = f.api.stage_reports().pop().unwrap();
        assert_eq!((last.stage_id.as_str(), last.status), ("stage-0", StageStatus::Running));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_stages() {
        let f = fixture(&[]).await;
        let mut d = deployment();
        d.status = DeploymentStatus::Running;
        d.stages[0].status = StageStatus::Success;
        let (_handler, handle) = run(&f, d);

        assert_eq!(handle.await.unwrap(), DeploymentStatus::Success);
        assert_eq!(calls(&f), ["stage-1"]);
        assert!(f.api.status_changes().is_empty());
    }
}
