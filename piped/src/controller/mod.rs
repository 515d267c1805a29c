//! Deployment controller
//!
//! Plans the pending deployments of this piped and hands the planned ones to
//! a [`Scheduler`]. An application never has more than one deployment in
//! flight: a pending deployment waits until the previous one of the same
//! application completed.

pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::state::AppState;
use crate::errors::PipedError;
use crate::executor::{new_stop_signal, StopSignalHandler, StopSignalKind};
use crate::http::{DeploymentCompletedReport, DeploymentPlannedReport};
use crate::model::{Deployment, DeploymentStatus};
use crate::planner;
use crate::utils::{now_unix, Retry};

pub use scheduler::Scheduler;

const REPORT_RETRIES: u32 = 10;

struct Running {
    deployment_id: String,
    handle: JoinHandle<DeploymentStatus>,
}

pub struct Controller {
    state: Arc<AppState>,
    shutdown: StopSignalHandler,
    /// Schedulers in flight keyed by application id
    schedulers: Mutex<HashMap<String, Running>>,
}

impl Controller {
    pub fn new(state: Arc<AppState>) -> Self {
        let (shutdown, _) = new_stop_signal();
        Self {
            state,
            shutdown,
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Running>>, PipedError> {
        self.schedulers
            .lock()
            .map_err(|_| PipedError::Internal("scheduler table lock poisoned".to_string()))
    }

    /// Ids of the deployments currently being run
    pub fn running_deployments(&self) -> Vec<String> {
        match self.lock() {
            Ok(table) => table.values().map(|r| r.deployment_id.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// One reconciliation pass over the not completed deployments
    pub async fn sync_once(&self) -> Result<(), PipedError> {
        self.lock()?.retain(|_, r| !r.handle.is_finished());

        let mut deployments = self.state.api.list_not_completed_deployments().await?;
        deployments.sort_by_key(|d| d.created_at);

        let mut busy: HashSet<String> = self.lock()?.keys().cloned().collect();
        for d in deployments.iter().filter(|d| d.status != DeploymentStatus::Pending) {
            if busy.insert(d.application_id.clone()) {
                self.start_scheduler(d.clone())?;
            }
        }

        for d in deployments.into_iter().filter(|d| d.status == DeploymentStatus::Pending) {
            if busy.contains(&d.application_id) {
                continue;
            }
            busy.insert(d.application_id.clone());
            if let Err(e) = self.plan(&d).await {
                error!("Failed to plan deployment {}: {}", d.id, e);
            }
        }
        Ok(())
    }

    fn start_scheduler(&self, deployment: Deployment) -> Result<(), PipedError> {
        let app_id = deployment.application_id.clone();
        let deployment_id = deployment.id.clone();
        let scheduler = Scheduler::new(deployment, self.state.clone())?;
        info!("Starting scheduler for deployment {}", deployment_id);
        let handle = tokio::spawn(scheduler.run(self.shutdown.subscribe()));
        self.lock()?.insert(app_id, Running { deployment_id, handle });
        Ok(())
    }

    /// Plan a pending deployment and report the result
    pub async fn plan(&self, deployment: &Deployment) -> Result<(), PipedError> {
        info!("Planning deployment {} of application {}", deployment.id, deployment.application_id);
        let work_dir = self.state.piped.working_dir.join("planner").join(&deployment.id);
        let result = self.build_plan(deployment, &work_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Unable to remove planner working directory {}: {}", work_dir.display(), e);
            }
        }

        let api = &self.state.api;
        match result {
            Ok(report) => {
                let report = &report;
                Retry::exponential(REPORT_RETRIES)
                    .run(|| async move { api.report_deployment_planned(report).await })
                    .await?;
                info!("Deployment {} was planned: {}", deployment.id, report.summary);
            }
            Err(e) => {
                let report = &DeploymentCompletedReport {
                    deployment_id: deployment.id.clone(),
                    status: DeploymentStatus::Failure,
                    status_reason: format!("Unable to plan the deployment ({})", e),
                    stage_statuses: HashMap::new(),
                    completed_at: now_unix(),
                };
                Retry::exponential(REPORT_RETRIES)
                    .run(|| async move { api.report_deployment_completed(report).await })
                    .await?;
                warn!("Deployment {} failed while planning: {}", deployment.id, e);
            }
        }
        Ok(())
    }

    async fn build_plan(
        &self,
        deployment: &Deployment,
        work_dir: &std::path::Path,
    ) -> Result<DeploymentPlannedReport, PipedError> {
        let planner = self.state.planners.planner(deployment.kind).ok_or_else(|| {
            PipedError::NotFound(format!("no registered planner for application kind {}", deployment.kind))
        })?;

        let last = self
            .state
            .api
            .get_most_recent_successful_deployment(&deployment.application_id)
            .await?;
        let (running_commit_hash, running_config_filename) = match &last {
            Some(d) => (d.trigger.commit.hash.clone(), d.git_path.config_filename.clone()),
            None => (String::new(), String::new()),
        };

        let target_ds = self.state.source_provider(
            &work_dir.join("target"),
            &deployment.git_path,
            deployment.kind,
            "target",
            deployment.target_commit_hash(),
        )?;
        let running_ds = match &last {
            Some(last) if !running_commit_hash.is_empty() => Some(self.state.source_provider(
                &work_dir.join("running"),
                &last.git_path,
                deployment.kind,
                "running",
                &running_commit_hash,
            )?),
            _ => None,
        };

        let input = planner::Input {
            deployment: Arc::new(deployment.clone()),
            most_recent_successful_commit_hash: running_commit_hash.clone(),
            target_ds,
            running_ds,
            manifests_cache: self.state.manifests_cache.clone(),
            regex_pool: self.state.regex_pool,
        };
        let out = planner.plan(&input).await?;
        Ok(DeploymentPlannedReport {
            deployment_id: deployment.id.clone(),
            summary: out.summary,
            status_reason: "The deployment has been planned".to_string(),
            running_commit_hash,
            running_config_filename,
            version: out.version,
            versions: out.versions,
            stages: out.stages,
        })
    }

    /// Interrupt every scheduler and wait for them to return. Interrupted
    /// deployments are resumed by the next piped process.
    pub async fn shutdown(&self) {
        info!("Controller shutting down...");
        self.shutdown.send(StopSignalKind::Terminate);
        let running: Vec<Running> = match self.lock() {
            Ok(mut table) => table.drain().map(|(_, r)| r).collect(),
            Err(_) => Vec::new(),
        };
        for r in running {
            if let Err(e) = r.handle.await {
                error!("Scheduler of deployment {} panicked: {}", r.deployment_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::state::testing::state;
    use crate::controller::scheduler::testing::registry;
    use crate::git::testing::DirGitClient;
    use crate::http::InMemoryApi;
    use crate::model::{ApplicationKind, StageName, StageStatus, SyncStrategy};
    use crate::planner::testing::write_app;

    const APP: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_SYNC
"#;

    const CONFIGMAP: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: config
data:
  key: value
"#;

    async fn controller(
        app: &str,
        outcomes: &[(&str, Option<StageStatus>)],
    ) -> (tempfile::TempDir, Controller, Arc<InMemoryApi>) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_app(&repo, &[("app.pipecd.yaml", app), ("configmap.yaml", CONFIGMAP)]).await;
        let git = DirGitClient {
            src: repo,
            ..Default::default()
        };
        let (mut state, api) = state(dir.path(), git).await;
        state.executors = Arc::new(registry(outcomes, Default::default()));
        (dir, Controller::new(Arc::new(state)), api)
    }

    fn pending(id: &str, created_at: i64) -> Deployment {
        let mut d = crate::executor::testing::deployment(ApplicationKind::Kubernetes);
        d.id = id.to_string();
        d.created_at = created_at;
        d
    }

    async fn wait_completed(api: &InMemoryApi, n: usize) {
        for _ in 0..500 {
            if api.completed_reports().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployments were not completed in time");
    }

    #[tokio::test]
    async fn test_plan_then_run() {
        let (_dir, controller, api) = controller(APP, &[]).await;
        api.add_deployment(pending("dep-1", 1)).unwrap();

        controller.sync_once().await.unwrap();
        let planned = api.planned_reports();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].running_commit_hash, "");
        let names: Vec<StageName> = planned[0].stages.iter().map(|s| s.name).collect();
        assert_eq!(names, [StageName::K8sSync, StageName::Rollback]);

        controller.sync_once().await.unwrap();
        wait_completed(&api, 1).await;
        assert_eq!(api.completed_reports()[0].status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn test_one_deployment_per_application() {
        let (_dir, controller, api) = controller(APP, &[("K8S_SYNC", None)]).await;
        api.add_deployment(pending("dep-1", 1)).unwrap();
        api.add_deployment(pending("dep-2", 2)).unwrap();

        controller.sync_once().await.unwrap();
        assert_eq!(api.planned_reports().len(), 1);
        assert_eq!(api.planned_reports()[0].deployment_id, "dep-1");

        controller.sync_once().await.unwrap();
        assert_eq!(controller.running_deployments(), ["dep-1"]);
        // dep-2 keeps waiting while dep-1 runs
        controller.sync_once().await.unwrap();
        assert_eq!(api.planned_reports().len(), 1);

        controller.shutdown().await;
        assert!(api.completed_reports().is_empty());
    }

    #[tokio::test]
    async fn test_planning_failure_completes_deployment() {
        let (_dir, controller, api) = controller(APP.replace("KubernetesApp", "ECSApp").as_str(), &[]).await;
        let mut d = pending("dep-1", 1);
        d.trigger.sync_strategy = SyncStrategy::Pipeline;
        api.add_deployment(d).unwrap();

        controller.sync_once().await.unwrap();
        let completed = api.completed_reports();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, DeploymentStatus::Failure);
        assert!(completed[0].status_reason.starts_with("Unable to plan the deployment"));
        assert!(api.planned_reports().is_empty());
    }
}
