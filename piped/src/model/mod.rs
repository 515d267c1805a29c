//! Data models shared across piped components

pub mod application;
pub mod artifact;
pub mod command;
pub mod deployment;
pub mod logblock;
pub mod stage;

pub use application::{
    Application, DEFAULT_APPLICATION_CONFIG_FILENAME, ApplicationGitPath, ApplicationKind, ApplicationRepo, ApplicationSyncState,
    ApplicationSyncStatus,
};
pub use artifact::{ArtifactKind, ArtifactVersion};
pub use command::{
    ApplicationPlanPreviewResult, BuildPlanPreview, Command, CommandKind, CommandStatus,
    PlanPreviewCommandResult,
};
pub use deployment::{Commit, Deployment, DeploymentStatus, DeploymentTrigger, SyncStrategy};
pub use logblock::{LogBlock, LogSeverity};
pub use stage::{PipelineStage, StageName, StageStatus};
