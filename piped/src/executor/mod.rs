//! Stage executors
//!
//! Every pipeline stage is run by an [`Executor`] created from the
//! [`Registry`] for the stage name. Rollback stages are dispatched on the
//! application kind instead, since the way to restore a previous commit
//! only depends on the runtime.

pub mod analysis;
pub mod cloudrun;
pub mod customsync;
pub mod ecs;
pub mod kubernetes;
pub mod lambda;
pub mod logpersister;
pub mod metadata;
pub mod scriptrun;
pub mod skip;
pub mod stopsignal;
pub mod terraform;
pub mod wait;
pub mod waitapproval;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::application::ApplicationConfig;
use crate::config::piped::{PipedSpec, PlatformProvider};
use crate::config::stage::{PipelineStageConfig, StageOptions};
use crate::deploysource::{DeploySource, Provider};
use crate::errors::PipedError;
use crate::git::GitClient;
use crate::http::{CommandHandledReport, PipedApi};
use crate::logs::StageLogWriter;
use crate::model::{
    ApplicationKind, Command, CommandKind, CommandStatus, Deployment, PipelineStage, StageName,
    StageStatus,
};
use crate::platformprovider::PlatformClients;

pub use logpersister::StageLogPersister;
pub use metadata::{MetadataStore, SharedMetadata, StageMetadata};
pub use skip::check_skip;
pub use stopsignal::{determine_stage_status, new_stop_signal, StopSignal, StopSignalHandler, StopSignalKind};

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the stage until it completes or `sig` asks it to stop
    async fn execute(&self, sig: &StopSignal) -> StageStatus;
}

pub type Factory = Arc<dyn Fn(Input) -> Box<dyn Executor> + Send + Sync>;

/// Commands addressed to the running stage
#[async_trait]
pub trait CommandLister: Send + Sync {
    async fn list_commands(&self) -> Vec<Command>;

    async fn report_handled(&self, command: &Command, status: CommandStatus) -> Result<(), PipedError>;
}

/// Lists the unhandled commands of one stage through the control plane
pub struct ApiCommandLister {
    api: Arc<dyn PipedApi>,
    deployment_id: String,
    stage_id: String,
}

impl ApiCommandLister {
    pub fn new(api: Arc<dyn PipedApi>, deployment_id: &str, stage_id: &str) -> Self {
        Self {
            api,
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
        }
    }
}

#[async_trait]
impl CommandLister for ApiCommandLister {
    async fn list_commands(&self) -> Vec<Command> {
        match self.api.list_unhandled_commands().await {
            Ok(commands) => commands
                .into_iter()
                .filter(|c| c.deployment_id == self.deployment_id && c.stage_id == self.stage_id)
                .filter(|c| matches!(c.kind, CommandKind::ApproveStage))
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to list commands of stage {}: {}", self.stage_id, e);
                Vec::new()
            }
        }
    }

    async fn report_handled(&self, command: &Command, status: CommandStatus) -> Result<(), PipedError> {
        self.api
            .report_command_handled(&CommandHandledReport {
                command_id: command.id.clone(),
                status,
                metadata: HashMap::new(),
                output: None,
            })
            .await
    }
}

/// Everything an executor needs to run one stage
#[derive(Clone)]
pub struct Input {
    pub deployment: Arc<Deployment>,
    pub stage: PipelineStage,
    /// `None` for stages generated by the planner
    pub stage_config: Option<PipelineStageConfig>,
    pub app_config: Arc<ApplicationConfig>,
    pub piped: Arc<PipedSpec>,
    pub target_ds: Arc<dyn Provider>,
    /// `None` on the first deployment of the application
    pub running_ds: Option<Arc<dyn Provider>>,
    pub api: Arc<dyn PipedApi>,
    pub metadata: MetadataStore,
    pub log: Arc<StageLogPersister>,
    pub commands: Arc<dyn CommandLister>,
    pub clients: Arc<PlatformClients>,
    pub git_client: Arc<dyn GitClient>,
    pub working_dir: PathBuf,
}

impl Input {
    pub fn lw(&self) -> &dyn StageLogWriter {
        self.log.as_ref()
    }

    pub fn stage_options(&self) -> Option<&StageOptions> {
        self.stage_config.as_ref().map(|c| &c.options)
    }

    pub fn stage_metadata(&self) -> StageMetadata {
        self.metadata.stage(&self.stage.id)
    }

    /// Platform provider the application is bound to. Failures are logged.
    pub fn find_platform_provider(&self) -> Option<&PlatformProvider> {
        let name = &self.deployment.platform_provider;
        if name.is_empty() {
            self.lw()
                .error("Missing the platform provider name in the application configuration");
            return None;
        }
        match self.piped.find_platform_provider(name, self.deployment.kind) {
            Ok(provider) => Some(provider),
            Err(e) => {
                self.lw().error(&format!(
                    "The specified platform provider {} was not usable ({})",
                    name, e
                ));
                None
            }
        }
    }

    /// Writable copy of the target deploy source. Failures are logged.
    pub async fn target_source(&self) -> Option<DeploySource> {
        match self.target_ds.get(self.lw()).await {
            Ok(ds) => Some(ds),
            Err(e) => {
                self.lw()
                    .error(&format!("Failed to prepare target deploy source data ({})", e));
                None
            }
        }
    }

    /// Writable copy of the running deploy source. Fails on the first deployment.
    pub async fn running_source(&self) -> Option<DeploySource> {
        let Some(provider) = &self.running_ds else {
            self.lw().error(
                "Unable to determine the last deployed commit to rollback. It seems this is the first deployment.",
            );
            return None;
        };
        match provider.get(self.lw()).await {
            Ok(ds) => Some(ds),
            Err(e) => {
                self.lw()
                    .error(&format!("Failed to prepare running deploy source data ({})", e));
                None
            }
        }
    }
}

/// Drive `fut` to completion unless a stop signal comes first, in which case
/// `fut` is dropped.
pub async fn until_stopped<F: Future>(sig: &StopSignal, fut: F) -> Result<F::Output, StopSignalKind> {
    tokio::select! {
        out = fut => Ok(out),
        kind = sig.wait() => Err(kind),
    }
}

/// Status an executor returns when it was interrupted
pub fn status_on_stop(kind: StopSignalKind, original: StageStatus) -> StageStatus {
    determine_stage_status(kind, original, StageStatus::Failure)
}

#[derive(Default)]
pub struct Registry {
    factories: HashMap<StageName, Factory>,
    rollback_factories: HashMap<ApplicationKind, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: StageName, factory: Factory) -> Result<(), PipedError> {
        if self.factories.contains_key(&stage) {
            return Err(PipedError::Conflict(format!(
                "executor for {} stage has already been registered",
                stage
            )));
        }
        self.factories.insert(stage, factory);
        Ok(())
    }

    pub fn register_rollback(&mut self, kind: ApplicationKind, factory: Factory) -> Result<(), PipedError> {
        if self.rollback_factories.contains_key(&kind) {
            return Err(PipedError::Conflict(format!(
                "rollback executor for {} application kind has already been registered",
                kind
            )));
        }
        self.rollback_factories.insert(kind, factory);
        Ok(())
    }

    /// Executor for the input stage, `None` when nothing handles it
    pub fn executor(&self, input: Input) -> Option<Box<dyn Executor>> {
        let factory = if input.stage.name == StageName::Rollback {
            self.rollback_factories.get(&input.deployment.kind)?
        } else {
            self.factories.get(&input.stage.name)?
        };
        Some(factory(input))
    }

    pub fn has_executor(&self, stage: StageName, kind: ApplicationKind) -> bool {
        if stage == StageName::Rollback {
            self.rollback_factories.contains_key(&kind)
        } else {
            self.factories.contains_key(&stage)
        }
    }

    /// Registry with every built-in executor
    pub fn with_defaults() -> Result<Self, PipedError> {
        let mut r = Self::new();
        wait::register(&mut r)?;
        waitapproval::register(&mut r)?;
        analysis::register(&mut r)?;
        scriptrun::register(&mut r)?;
        customsync::register(&mut r)?;
        kubernetes::register(&mut r)?;
        cloudrun::register(&mut r)?;
        terraform::register(&mut r)?;
        lambda::register(&mut r)?;
        ecs::register(&mut r)?;
        Ok(r)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(StageStatus);

    #[async_trait]
    impl Executor for Fixed {
        async fn execute(&self, _sig: &StopSignal) -> StageStatus {
            self.0
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut r = Registry::new();
        let f: Factory = Arc::new(|_| Box::new(Fixed(StageStatus::Success)));
        r.register(StageName::Wait, f.clone()).unwrap();
        assert!(r.register(StageName::Wait, f.clone()).is_err());
        r.register_rollback(ApplicationKind::Ecs, f.clone()).unwrap();
        assert!(r.register_rollback(ApplicationKind::Ecs, f).is_err());
    }

    #[test]
    fn test_default_registry_covers_every_stage() {
        let r = Registry::with_defaults().unwrap();
        for stage in [
            StageName::Wait,
            StageName::WaitApproval,
            StageName::Analysis,
            StageName::ScriptRun,
            StageName::CustomSync,
            StageName::CustomSyncRollback,
            StageName::K8sSync,
            StageName::CloudRunSync,
            StageName::CloudRunPromote,
            StageName::TerraformSync,
            StageName::TerraformPlan,
            StageName::TerraformApply,
            StageName::LambdaSync,
            StageName::LambdaPromote,
            StageName::LambdaCanaryRollout,
            StageName::EcsSync,
        ] {
            assert!(r.has_executor(stage, ApplicationKind::Kubernetes), "{}", stage);
        }
        for kind in ApplicationKind::all() {
            assert!(r.has_executor(StageName::Rollback, kind), "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_until_stopped() {
        let (handler, sig) = new_stop_signal();
        assert_eq!(until_stopped(&sig, async { 7 }).await, Ok(7));
        handler.send(StopSignalKind::Cancel);
        let out = until_stopped(&sig, std::future::pending::<()>()).await;
        assert_eq!(out, Err(StopSignalKind::Cancel));
        assert_eq!(
            status_on_stop(StopSignalKind::Terminate, StageStatus::Running),
            StageStatus::Running
        );
    }
}
