//! CUSTOM_SYNC stage: deploy with a user script instead of the built-in sync
//!
//! The rollback counterpart runs the CUSTOM_SYNC script declared at the
//! running commit, from the running commit's application directory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::stage::{CustomSyncStageOptions, StageOptions};
use crate::errors::PipedError;
use crate::executor::scriptrun::{context_envs, ShellScript};
use crate::executor::{Executor, Input, Registry, StopSignal};
use crate::model::{StageName, StageStatus};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::CustomSync, Arc::new(|input| Box::new(CustomSyncExecutor { input })))?;
    r.register(
        StageName::CustomSyncRollback,
        Arc::new(|input| Box::new(CustomSyncRollbackExecutor { input })),
    )
}

/// Install the external tools then run the script from `app_dir`
async fn run_custom_sync(
    input: &Input,
    opts: &CustomSyncStageOptions,
    app_dir: &std::path::Path,
    is_rollback: bool,
    sig: &StopSignal,
) -> StageStatus {
    let lw = input.lw();
    let registry = input.clients.tool_registry();
    for tool in &opts.external_tools {
        match registry.external_tool(app_dir, tool).await {
            Ok(true) => lw.info(&format!("Installed {} {}", tool.command, tool.version)),
            Ok(false) => {}
            Err(e) => {
                lw.error(&format!(
                    "Unable to prepare {} {} ({})",
                    tool.command, tool.version, e
                ));
                return StageStatus::Failure;
            }
        }
    }

    let mut envs = context_envs(input, is_rollback);
    envs.extend(opts.envs.clone());
    let script = ShellScript {
        run: &opts.run,
        dir: app_dir,
        envs,
        timeout: opts.timeout,
        extra_path: Some(registry.bin_dir()),
    };
    script.run(lw, sig, input.stage.status).await
}

pub struct CustomSyncExecutor {
    input: Input,
}

#[async_trait]
impl Executor for CustomSyncExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let Some(StageOptions::CustomSync(opts)) = self.input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
            return StageStatus::Failure;
        };
        let Some(ds) = self.input.target_source().await else {
            return StageStatus::Failure;
        };
        lw.info("Start syncing the deployment with the custom script");
        run_custom_sync(&self.input, opts, &ds.app_dir, false, sig).await
    }
}

pub struct CustomSyncRollbackExecutor {
    input: Input,
}

#[async_trait]
impl Executor for CustomSyncRollbackExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let Some(ds) = self.input.running_source().await else {
            return StageStatus::Failure;
        };
        let opts = ds
            .config
            .generic
            .pipeline
            .as_ref()
            .and_then(|p| {
                p.stages.iter().find_map(|s| match &s.options {
                    StageOptions::CustomSync(o) => Some(o.clone()),
                    _ => None,
                })
            });
        let Some(opts) = opts else {
            lw.error("No CUSTOM_SYNC stage is declared at the running commit, nothing to roll back with");
            return StageStatus::Failure;
        };
        lw.info(&format!(
            "Rolling back by running the custom sync script of commit {}",
            ds.revision
        ));
        run_custom_sync(&self.input, &opts, &ds.app_dir, true, sig).await
    }
}
