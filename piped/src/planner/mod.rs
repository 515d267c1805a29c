//! Deployment planners
//!
//! A [`Planner`] decides how a deployment is going to be synced and turns the
//! decision into the list of stages the scheduler runs. The decision steps
//! shared by every application kind live in [`decide_common`], each kind only
//! adds what it knows about its own manifests.

pub mod cloudrun;
pub mod ecs;
pub mod kubernetes;
pub mod lambda;
pub mod terraform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::AppManifestsCache;
use crate::config::application::GenericApplicationSpec;
use crate::config::stage::PipelineConfig;
use crate::deploysource::{DeploySource, Provider};
use crate::errors::PipedError;
use crate::logs::TracingLogWriter;
use crate::model::artifact::summarize_versions;
use crate::model::{ApplicationKind, ArtifactVersion, Deployment, PipelineStage, StageName, SyncStrategy};
use crate::platformprovider::kubernetes::Manifest;
use crate::regexpool::RegexPool;

pub const ROLLBACK_STAGE_ID: &str = "rollback";

/// Everything a planner may look at
#[derive(Clone)]
pub struct Input {
    pub deployment: Arc<Deployment>,
    /// Empty when the application was never deployed successfully
    pub most_recent_successful_commit_hash: String,
    pub target_ds: Arc<dyn Provider>,
    pub running_ds: Option<Arc<dyn Provider>>,
    pub manifests_cache: Arc<AppManifestsCache<Vec<Manifest>>>,
    pub regex_pool: &'static RegexPool,
}

impl Input {
    fn log_writer(&self) -> TracingLogWriter {
        TracingLogWriter::new(format!("planner/{}", self.deployment.id))
    }

    pub async fn target_source(&self) -> Result<Arc<DeploySource>, PipedError> {
        self.target_ds
            .get_readonly(&self.log_writer())
            .await
            .map_err(|e| PipedError::Internal(format!("error while preparing deploy source data ({})", e)))
    }

    pub async fn running_source(&self) -> Result<Arc<DeploySource>, PipedError> {
        let provider = self.running_ds.as_ref().ok_or_else(|| {
            PipedError::NotFound("no running deploy source for the application".to_string())
        })?;
        provider
            .get_readonly(&self.log_writer())
            .await
            .map_err(|e| PipedError::Internal(format!("failed to prepare the running deploy source data ({})", e)))
    }

    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub sync_strategy: SyncStrategy,
    pub summary: String,
    pub stages: Vec<PipelineStage>,
    pub version: String,
    pub versions: Vec<ArtifactVersion>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &Input) -> Result<Output, PipedError>;
}

#[derive(Default)]
pub struct Registry {
    planners: HashMap<ApplicationKind, Arc<dyn Planner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ApplicationKind, planner: Arc<dyn Planner>) -> Result<(), PipedError> {
        if self.planners.contains_key(&kind) {
            return Err(PipedError::Conflict(format!(
                "planner for {} application kind has already been registered",
                kind
            )));
        }
        self.planners.insert(kind, planner);
        Ok(())
    }

    pub fn planner(&self, kind: ApplicationKind) -> Option<Arc<dyn Planner>> {
        self.planners.get(&kind).cloned()
    }

    pub fn with_defaults() -> Result<Self, PipedError> {
        let mut r = Self::new();
        r.register(ApplicationKind::Kubernetes, Arc::new(kubernetes::KubernetesPlanner))?;
        r.register(ApplicationKind::CloudRun, Arc::new(cloudrun::CloudRunPlanner))?;
        r.register(ApplicationKind::Lambda, Arc::new(lambda::LambdaPlanner))?;
        r.register(ApplicationKind::Terraform, Arc::new(terraform::TerraformPlanner))?;
        r.register(ApplicationKind::Ecs, Arc::new(ecs::EcsPlanner))?;
        Ok(r)
    }
}

/// How the deployment is going to be synced and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub strategy: SyncStrategy,
    pub summary: String,
}

impl Decision {
    pub fn quick_sync(summary: impl Into<String>) -> Self {
        Self {
            strategy: SyncStrategy::QuickSync,
            summary: summary.into(),
        }
    }

    pub fn pipeline(summary: impl Into<String>) -> Self {
        Self {
            strategy: SyncStrategy::Pipeline,
            summary: summary.into(),
        }
    }
}

/// Summaries a kind uses for the quick syncs decided without looking at manifests
pub struct QuickSyncSummaries {
    pub no_pipeline: String,
    pub first_deployment: String,
}

impl Default for QuickSyncSummaries {
    fn default() -> Self {
        Self {
            no_pipeline: "Quick sync by applying all manifests (no pipeline was configured)".to_string(),
            first_deployment: "Quick sync by applying all manifests because it seems this is the first deployment"
                .to_string(),
        }
    }
}

/// Decision steps every kind shares. `None` leaves the decision to the kind.
pub fn decide_common(
    input: &Input,
    spec: &GenericApplicationSpec,
    summaries: QuickSyncSummaries,
) -> Result<Option<Decision>, PipedError> {
    let trigger = &input.deployment.trigger;

    // Decided by the trigger, e.g. a sync requested from the web console
    match trigger.sync_strategy {
        SyncStrategy::QuickSync => return Ok(Some(Decision::quick_sync(trigger.strategy_summary.clone()))),
        SyncStrategy::Pipeline => {
            if !spec.has_pipeline() {
                return Err(PipedError::Config(
                    "unable to force sync with pipeline because no pipeline was specified".to_string(),
                ));
            }
            return Ok(Some(Decision::pipeline(trigger.strategy_summary.clone())));
        }
        SyncStrategy::Auto => {}
    }

    if !spec.has_pipeline() {
        return Ok(Some(Decision::quick_sync(summaries.no_pipeline)));
    }

    if spec.planner.always_use_pipeline {
        return Ok(Some(Decision::pipeline(
            "Sync with the specified pipeline (alwaysUsePipeline was set)",
        )));
    }

    // Commit matchers only apply to deployments triggered by a commit
    if trigger.commander.is_empty() {
        let message = &trigger.commit.message;
        let pattern = &spec.commit_matcher.pipeline;
        if !pattern.is_empty() && input.regex_pool.get(pattern)?.is_match(message) {
            return Ok(Some(Decision::pipeline(format!(
                "Sync progressively because the commit message was matching {:?}",
                pattern
            ))));
        }
        let pattern = &spec.commit_matcher.quick_sync;
        if !pattern.is_empty() && input.regex_pool.get(pattern)?.is_match(message) {
            return Ok(Some(Decision::quick_sync(format!(
                "Quick sync by applying all manifests because the commit message was matching {:?}",
                pattern
            ))));
        }
    }

    if input.most_recent_successful_commit_hash.is_empty() {
        return Ok(Some(Decision::quick_sync(summaries.first_deployment)));
    }
    Ok(None)
}

/// The stage a quick sync of `kind` runs
pub fn quick_sync_stage_name(kind: ApplicationKind) -> StageName {
    match kind {
        ApplicationKind::Kubernetes => StageName::K8sSync,
        ApplicationKind::Terraform => StageName::TerraformSync,
        ApplicationKind::CloudRun => StageName::CloudRunSync,
        ApplicationKind::Lambda => StageName::LambdaSync,
        ApplicationKind::Ecs => StageName::EcsSync,
    }
}

fn predefined_desc(name: StageName) -> &'static str {
    match name {
        StageName::K8sSync => "Sync by applying all manifests",
        StageName::TerraformSync => "Sync by automatically applying any detected changes",
        StageName::CloudRunSync | StageName::LambdaSync => "Deploy the new version and configure all traffic to it",
        StageName::EcsSync => "Sync by registering the task definition and updating the service",
        StageName::Rollback => "Rollback the deployment",
        StageName::CustomSyncRollback => "Rollback the custom sync",
        _ => "",
    }
}

fn rollback_stage(name: StageName, index: u32, now: i64) -> PipelineStage {
    let mut stage = PipelineStage::new(ROLLBACK_STAGE_ID, name, index, now);
    stage.desc = predefined_desc(name).to_string();
    stage.predefined = true;
    stage.visible = false;
    stage.rollback = true;
    stage
}

/// A single sync stage, followed by a hidden rollback stage when enabled
pub fn build_quick_sync_pipeline(kind: ApplicationKind, auto_rollback: bool, now: i64) -> Vec<PipelineStage> {
    let name = quick_sync_stage_name(kind);
    let mut sync = PipelineStage::new(name.as_str(), name, 0, now);
    sync.desc = predefined_desc(name).to_string();
    sync.predefined = true;

    let mut stages = vec![sync];
    if auto_rollback {
        stages.push(rollback_stage(StageName::Rollback, 1, now));
    }
    stages
}

/// The configured stages chained one after another.
///
/// Pipelines running a `CUSTOM_SYNC` are rolled back by `CUSTOM_SYNC_ROLLBACK`.
pub fn build_progressive_pipeline(pipeline: &PipelineConfig, auto_rollback: bool, now: i64) -> Vec<PipelineStage> {
    let mut stages: Vec<PipelineStage> = Vec::with_capacity(pipeline.stages.len() + 1);
    for (i, cfg) in pipeline.stages.iter().enumerate() {
        let id = if cfg.id.is_empty() {
            format!("stage-{}", i)
        } else {
            cfg.id.clone()
        };
        let mut stage = PipelineStage::new(id, cfg.name, i as u32, now);
        stage.desc = cfg.desc.clone();
        if let Some(prev) = stages.last() {
            stage.requires = vec![prev.id.clone()];
        }
        stages.push(stage);
    }

    if auto_rollback {
        let name = if pipeline.stages.iter().any(|s| s.name == StageName::CustomSync) {
            StageName::CustomSyncRollback
        } else {
            StageName::Rollback
        };
        let index = stages.len() as u32;
        stages.push(rollback_stage(name, index, now));
    }
    stages
}

/// Assemble the output of a decision
pub fn build_output(
    input: &Input,
    decision: Decision,
    spec: &GenericApplicationSpec,
    auto_rollback: bool,
    versions: Vec<ArtifactVersion>,
) -> Output {
    let now = input.now();
    let stages = match (&decision.strategy, &spec.pipeline) {
        (SyncStrategy::Pipeline, Some(pipeline)) => build_progressive_pipeline(pipeline, auto_rollback, now),
        _ => build_quick_sync_pipeline(input.deployment.kind, auto_rollback, now),
    };
    let versions = if versions.is_empty() {
        vec![ArtifactVersion::unknown()]
    } else {
        versions
    };
    Output {
        sync_strategy: decision.strategy,
        summary: decision.summary,
        stages,
        version: summarize_versions(&versions),
        versions,
    }
}
