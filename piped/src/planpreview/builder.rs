use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::diff::{self, PlanDiff};
use crate::app::state::AppState;
use crate::config::piped::PipedRepository;
use crate::deploysource::{DeploySourceProvider, LocalSourceCloner, Provider};
use crate::errors::PipedError;
use crate::git::Repo;
use crate::logs::TracingLogWriter;
use crate::model::{
    Application, ApplicationKind, ApplicationPlanPreviewResult, BuildPlanPreview, Commit, Deployment,
    DeploymentTrigger,
};
use crate::planner::{self, Output};
use crate::trigger::Determiner;
use crate::utils::{generate_uuid, now_unix};

pub const MAX_WORKER_NUM: usize = 100;
pub const DEFAULT_WORKER_APP_NUM: usize = 3;

/// Commander recorded on the deployments planned for a preview
pub const PLAN_PREVIEW_COMMANDER: &str = "pipectl";

/// Number of workers building the results of `apps` applications
pub fn worker_num(apps: usize) -> usize {
    (apps / DEFAULT_WORKER_APP_NUM).clamp(1, MAX_WORKER_NUM)
}

fn result_of(app: &Application) -> ApplicationPlanPreviewResult {
    ApplicationPlanPreviewResult {
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        application_kind: Some(app.kind),
        env: app.env.clone(),
        ..Default::default()
    }
}

fn failed(app: &Application, error: String) -> ApplicationPlanPreviewResult {
    ApplicationPlanPreviewResult {
        error,
        ..result_of(app)
    }
}

pub fn sort_results(results: &mut [ApplicationPlanPreviewResult]) {
    results.sort_by(|a, b| {
        (&a.application_name, a.application_kind, &a.env).cmp(&(&b.application_name, b.application_kind, &b.env))
    });
}

/// An application triggered by the merged commit
struct Job {
    app: Application,
    /// Commit of the last successful deployment, empty if none
    previous_commit: String,
}

/// The merged working copy shared by every worker of one command
struct Merged<'a> {
    repo: Arc<dyn Repo>,
    commit: String,
    base_branch: &'a str,
    dir: &'a Path,
}

/// Computes what merging a pull request would deploy, without deploying anything
pub struct Builder {
    state: Arc<AppState>,
    work_dir: PathBuf,
}

impl Builder {
    pub fn new(state: Arc<AppState>) -> Self {
        let work_dir = state.piped.working_dir.join("plan-preview");
        Self { state, work_dir }
    }

    /// Results of every application triggered by merging the head branch, sorted
    /// by name, kind and env. Errors concern the command as a whole, a failure of
    /// one application is reported in its own result.
    pub async fn build(
        &self,
        command_id: &str,
        cmd: &BuildPlanPreview,
    ) -> Result<Vec<ApplicationPlanPreviewResult>, PipedError> {
        info!(
            "Building plan preview for command {} ({}@{} into {} of repository {})",
            command_id, cmd.head_branch, cmd.head_commit, cmd.base_branch, cmd.repository_id
        );
        let repo_cfg = self.state.piped.repository(&cmd.repository_id).ok_or_else(|| {
            PipedError::NotFound(format!(
                "repository {} was not found in piped configuration",
                cmd.repository_id
            ))
        })?;
        if repo_cfg.branch != cmd.base_branch {
            return Err(PipedError::Validation(format!(
                "base branch of repository {} was not matched, requested {}, expected {}",
                cmd.repository_id, cmd.base_branch, repo_cfg.branch
            )));
        }

        let apps = self.list_applications(&repo_cfg.id).await?;
        if apps.is_empty() {
            info!("No application of repository {} is handled by this piped", repo_cfg.id);
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", command_id))
            .tempdir_in(&self.work_dir)?;
        let repo = self.clone_merged(repo_cfg, cmd, &dir.path().join("repo")).await?;
        let commit = repo.latest_commit().await?.hash;

        let (jobs, mut results) = self.find_triggered(repo.as_ref(), apps, &commit).await;
        let merged = Merged {
            repo,
            commit,
            base_branch: &cmd.base_branch,
            dir: dir.path(),
        };
        results.extend(self.run_workers(&merged, jobs).await);
        sort_results(&mut results);
        Ok(results)
    }

    async fn list_applications(&self, repo_id: &str) -> Result<Vec<Application>, PipedError> {
        Ok(self
            .state
            .api
            .list_applications()
            .await?
            .into_iter()
            .filter(|app| !app.disabled && app.git_path.repo.id == repo_id)
            .collect())
    }

    /// Clone the base branch and merge the head commit into it
    async fn clone_merged(
        &self,
        repo_cfg: &PipedRepository,
        cmd: &BuildPlanPreview,
        dest: &Path,
    ) -> Result<Arc<dyn Repo>, PipedError> {
        let repo = self
            .state
            .git_client
            .clone_repo(&repo_cfg.id, &repo_cfg.remote, &repo_cfg.branch, dest)
            .await
            .map_err(|e| {
                PipedError::Git(format!(
                    "failed to clone git repository {} at branch {} ({})",
                    repo_cfg.id, repo_cfg.branch, e
                ))
            })?;

        let message = format!(
            "Plan-preview: merged {} commit from {} branch into {} base branch",
            cmd.head_commit, cmd.head_branch, cmd.base_branch
        );
        repo.merge_remote_branch(&cmd.head_branch, &cmd.head_commit, &message)
            .await
            .map_err(|e| {
                PipedError::Conflict(format!(
                    "detected conflicts between commit {} at {} branch and the base branch {} ({})",
                    cmd.head_commit, cmd.head_branch, cmd.base_branch, e
                ))
            })?;
        Ok(Arc::from(repo))
    }

    /// Split `apps` into the ones to build and the results of the ones that failed early
    async fn find_triggered(
        &self,
        repo: &dyn Repo,
        apps: Vec<Application>,
        commit: &str,
    ) -> (Vec<Job>, Vec<ApplicationPlanPreviewResult>) {
        let determiner = Determiner::new(repo, commit);
        let mut jobs = Vec::new();
        let mut failures = Vec::new();
        for app in apps {
            let previous_commit = match self.state.api.get_most_recent_successful_deployment(&app.id).await {
                Ok(Some(d)) => d.trigger.commit.hash,
                Ok(None) => String::new(),
                Err(e) if e.is_not_found() => String::new(),
                Err(e) => {
                    let error = format!("failed while finding the last successful deployment ({})", e);
                    failures.push(failed(&app, error));
                    continue;
                }
            };
            match determiner.should_trigger(&app, &previous_commit).await {
                Ok(true) => jobs.push(Job { app, previous_commit }),
                Ok(false) => debug!("Application {} is not triggered by commit {}", app.id, commit),
                Err(e) => {
                    let error = format!(
                        "failed while determining the application should be triggered or not, {}",
                        e
                    );
                    failures.push(failed(&app, error));
                }
            }
        }
        (jobs, failures)
    }

    async fn run_workers(&self, merged: &Merged<'_>, jobs: Vec<Job>) -> Vec<ApplicationPlanPreviewResult> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let workers = worker_num(jobs.len());
        info!("Building plan preview of {} applications with {} workers", jobs.len(), workers);

        let (job_tx, job_rx) = mpsc::channel::<Job>(jobs.len());
        let (result_tx, mut result_rx) = mpsc::channel(jobs.len());
        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let job_rx = Mutex::new(job_rx);
        let futures: Vec<_> = (0..workers)
            .map(|_| {
                let result_tx = result_tx.clone();
                let job_rx = &job_rx;
                async move {
                    loop {
                        let job = job_rx.lock().await.recv().await;
                        let Some(job) = job else {
                            return;
                        };
                        let result = self.build_app_guarded(merged, &job).await;
                        if result_tx.send(result).await.is_err() {
                            return;
                        }
                    }
                }
            })
            .collect();
        drop(result_tx);
        join_all(futures).await;

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        results
    }

    /// A panicking application turns into a failed result instead of taking the batch down
    async fn build_app_guarded(&self, merged: &Merged<'_>, job: &Job) -> ApplicationPlanPreviewResult {
        match AssertUnwindSafe(self.build_app(merged, job)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("Panic while building plan preview of application {}", job.app.id);
                failed(&job.app, "unexpected error while building plan preview".to_string())
            }
        }
    }

    async fn build_app(&self, merged: &Merged<'_>, job: &Job) -> ApplicationPlanPreviewResult {
        let app = &job.app;
        let mut result = result_of(app);
        let app_dir = merged.dir.join(&app.id);

        let provider = |name: &str, revision: &str| -> Arc<dyn Provider> {
            Arc::new(DeploySourceProvider::new(
                &app_dir.join(name),
                Box::new(LocalSourceCloner::new(merged.repo.clone(), name, revision)),
                app.git_path.clone(),
                app.kind,
                self.state.decrypter.clone(),
            ))
        };
        let input = planner::Input {
            deployment: Arc::new(self.deployment(app, merged, &job.previous_commit)),
            most_recent_successful_commit_hash: job.previous_commit.clone(),
            target_ds: provider("target", &merged.commit),
            running_ds: (!job.previous_commit.is_empty()).then(|| provider("running", &job.previous_commit)),
            manifests_cache: self.state.manifests_cache.clone(),
            regex_pool: self.state.regex_pool,
        };

        let out = match self.plan(&input).await {
            Ok(out) => out,
            Err(e) => {
                result.error = format!("failed while planning, {}", e);
                return result;
            }
        };
        info!(
            "Decided {} for application {} ({})",
            out.sync_strategy, app.id, app.kind
        );
        result.sync_strategy = out.sync_strategy;

        match self.diff(app, &input).await {
            Ok(PlanDiff {
                summary,
                details,
                no_change,
            }) => {
                result.plan_summary = summary;
                result.plan_details = details;
                result.no_change = no_change;
            }
            Err(e) => result.error = format!("failed while calculating diff, {}", e),
        }
        result
    }

    /// The deployment merging the head branch would create
    fn deployment(&self, app: &Application, merged: &Merged<'_>, previous_commit: &str) -> Deployment {
        Deployment {
            id: generate_uuid(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            piped_id: self.state.piped.piped_id.clone(),
            project_id: app.project_id.clone(),
            kind: app.kind,
            git_path: app.git_path.clone(),
            platform_provider: app.platform_provider.clone(),
            trigger: DeploymentTrigger {
                commit: Commit {
                    hash: merged.commit.clone(),
                    branch: merged.base_branch.to_string(),
                    ..Default::default()
                },
                commander: PLAN_PREVIEW_COMMANDER.to_string(),
                timestamp: now_unix(),
                ..Default::default()
            },
            running_commit_hash: previous_commit.to_string(),
            ..Default::default()
        }
    }

    async fn plan(&self, input: &planner::Input) -> Result<Output, PipedError> {
        let kind = input.deployment.kind;
        let planner = self
            .state
            .planners
            .planner(kind)
            .ok_or_else(|| PipedError::NotFound(format!("no registered planner for application kind {}", kind)))?;
        planner.plan(input).await
    }

    async fn diff(&self, app: &Application, input: &planner::Input) -> Result<PlanDiff, PipedError> {
        let lw = TracingLogWriter::new(format!("plan-preview/{}", app.id));
        let running = match &input.running_ds {
            Some(p) if app.kind != ApplicationKind::Terraform => Some(p.get_readonly(&lw).await?),
            _ => None,
        };
        match app.kind {
            ApplicationKind::Kubernetes => {
                let target = input.target_ds.get_readonly(&lw).await?;
                diff::kubernetes(app, &target, running.as_deref()).await
            }
            ApplicationKind::Terraform => {
                let target = input.target_ds.get(&lw).await?;
                diff::terraform(&self.state, app, &target).await
            }
            ApplicationKind::CloudRun | ApplicationKind::Lambda | ApplicationKind::Ecs => {
                let target = input.target_ds.get_readonly(&lw).await?;
                diff::manifests(&target, running.as_deref()).await
            }
        }
    }
}
