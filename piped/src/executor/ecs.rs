//! ECS_SYNC and ECS rollback

use std::sync::Arc;

use async_trait::async_trait;

use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, until_stopped, Executor, Input, Registry, StopSignal};
use crate::model::{ApplicationKind, StageName, StageStatus};
use crate::platformprovider::ecs::{self, Definitions};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::EcsSync, Arc::new(|input| Box::new(SyncExecutor { input })))?;
    r.register_rollback(ApplicationKind::Ecs, Arc::new(|input| Box::new(RollbackExecutor { input })))
}

/// Register the task definition of `ds` and point the service at it
async fn sync_source(input: &Input, ds: &DeploySource, commit: &str) -> bool {
    let lw = input.lw();
    let Some(provider) = input.find_platform_provider() else {
        return false;
    };
    let Some(spec) = ds.config.ecs_spec() else {
        lw.error("The application configuration is not an ECS one");
        return false;
    };
    let mut defs = match Definitions::load(&ds.app_dir, &spec.input).await {
        Ok(d) => d,
        Err(e) => {
            lw.error(&format!("Failed to load the ECS definitions ({})", e));
            return false;
        }
    };
    defs.add_builtin_tags(&input.deployment.piped_id, &input.deployment.application_id, commit);

    let client = match input.clients.ecs(provider).await {
        Ok(c) => c,
        Err(e) => {
            lw.error(&format!("Unable to create ECS client for the provider {} ({})", provider.name, e));
            return false;
        }
    };
    match ecs::sync(client.as_ref(), &defs, lw).await {
        Ok(()) => {
            lw.success(&format!("Successfully synced service {}", defs.service.service_name()));
            true
        }
        Err(e) => {
            lw.error(&format!("Failed to sync the ECS service ({})", e));
            false
        }
    }
}

pub struct SyncExecutor {
    input: Input,
}

#[async_trait]
impl Executor for SyncExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let work = async {
            let Some(ds) = self.input.target_source().await else {
                return StageStatus::Failure;
            };
            if sync_source(&self.input, &ds, self.input.deployment.target_commit_hash()).await {
                StageStatus::Success
            } else {
                StageStatus::Failure
            }
        };
        until_stopped(sig, work)
            .await
            .unwrap_or_else(|kind| status_on_stop(kind, self.input.stage.status))
    }
}

pub struct RollbackExecutor {
    input: Input,
}

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let work = async {
            let Some(ds) = self.input.running_source().await else {
                return StageStatus::Failure;
            };
            let commit = self.input.deployment.running_commit_hash.as_str();
            self.input
                .lw()
                .info(&format!("Rolling back the service to the definitions of commit {}", commit));
            if sync_source(&self.input, &ds, commit).await {
                StageStatus::Success
            } else {
                StageStatus::Failure
            }
        };
        until_stopped(sig, work)
            .await
            .unwrap_or_else(|kind| status_on_stop(kind, self.input.stage.status))
    }
}
