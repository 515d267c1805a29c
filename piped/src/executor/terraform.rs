//! TERRAFORM_SYNC, TERRAFORM_PLAN, TERRAFORM_APPLY and Terraform rollback

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::piped::PlatformProviderConfig;
use crate::config::stage::StageOptions;
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, until_stopped, Executor, Input, Registry, StopSignal};
use crate::model::{ApplicationKind, StageName, StageStatus};
use crate::platformprovider::terraform::{Options, Terraform};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    let f: crate::executor::Factory = Arc::new(|input| Box::new(DeployExecutor { input }));
    r.register(StageName::TerraformSync, f.clone())?;
    r.register(StageName::TerraformPlan, f.clone())?;
    r.register(StageName::TerraformApply, f)?;
    r.register_rollback(
        ApplicationKind::Terraform,
        Arc::new(|input| Box::new(RollbackExecutor { input })),
    )
}

/// Build a prepared (`init` + `workspace select`) terraform command for `ds`
async fn prepare(input: &Input, ds: &DeploySource) -> Option<Terraform> {
    let lw = input.lw();
    let provider = input.find_platform_provider()?;
    let provider_vars = match &provider.config {
        PlatformProviderConfig::Terraform(c) => c.vars.clone(),
        _ => Vec::new(),
    };
    let Some(spec) = ds.config.terraform_spec() else {
        lw.error("Malformed application configuration: missing the Terraform application spec");
        return None;
    };

    let exec_path = match input
        .clients
        .tool_registry()
        .terraform(&spec.input.terraform_version)
        .await
    {
        Ok((path, installed)) => {
            if installed {
                lw.info(&format!("Terraform {} has just been installed", spec.input.terraform_version));
            }
            path
        }
        Err(e) => {
            lw.error(&format!("Unable to find the required terraform {} ({})", spec.input.terraform_version, e));
            return None;
        }
    };

    let cmd = Terraform::new(exec_path, &ds.app_dir, Options::from_input(&spec.input, &provider_vars));
    if let Err(e) = cmd.prepare(&spec.input.workspace, lw).await {
        lw.error(&format!("Failed to prepare terraform ({})", e));
        return None;
    }
    Some(cmd)
}

async fn apply(input: &Input, cmd: &Terraform) -> StageStatus {
    let lw = input.lw();
    if let Err(e) = cmd.apply(lw).await {
        lw.error(&format!("Failed to apply changes ({})", e));
        return StageStatus::Failure;
    }
    lw.success("Successfully applied changes");
    StageStatus::Success
}

pub struct DeployExecutor {
    input: Input,
}

impl DeployExecutor {
    async fn ensure_sync(&self, cmd: &Terraform) -> StageStatus {
        let lw = self.input.lw();
        let plan = match cmd.plan(lw).await {
            Ok(p) => p,
            Err(e) => {
                lw.error(&format!("Failed to plan ({})", e));
                return StageStatus::Failure;
            }
        };
        if plan.no_changes() {
            lw.info("No changes to apply");
            return StageStatus::Success;
        }
        lw.info(&format!(
            "Detected {} add, {} change, {} destroy. Those changes will be applied automatically.",
            plan.adds, plan.changes, plan.destroys
        ));
        apply(&self.input, cmd).await
    }

    async fn ensure_plan(&self, cmd: &Terraform) -> StageStatus {
        let lw = self.input.lw();
        let exit_on_no_changes = match self.input.stage_options() {
            Some(StageOptions::TerraformPlan(o)) => o.exit_on_no_changes,
            _ => false,
        };
        let plan = match cmd.plan(lw).await {
            Ok(p) => p,
            Err(e) => {
                lw.error(&format!("Failed to plan ({})", e));
                return StageStatus::Failure;
            }
        };
        if plan.no_changes() {
            lw.success("No changes to apply");
            if exit_on_no_changes {
                return StageStatus::Exited;
            }
            return StageStatus::Success;
        }
        lw.success(&format!(
            "Detected {} add, {} change, {} destroy.",
            plan.adds, plan.changes, plan.destroys
        ));
        StageStatus::Success
    }

    async fn run(&self) -> StageStatus {
        let Some(ds) = self.input.target_source().await else {
            return StageStatus::Failure;
        };
        let Some(cmd) = prepare(&self.input, &ds).await else {
            return StageStatus::Failure;
        };
        match self.input.stage.name {
            StageName::TerraformSync => self.ensure_sync(&cmd).await,
            StageName::TerraformPlan => self.ensure_plan(&cmd).await,
            StageName::TerraformApply => apply(&self.input, &cmd).await,
            other => {
                self.input
                    .lw()
                    .error(&format!("Unsupported stage {} for terraform application", other));
                StageStatus::Failure
            }
        }
    }
}

#[async_trait]
impl Executor for DeployExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        until_stopped(sig, self.run())
            .await
            .unwrap_or_else(|kind| status_on_stop(kind, self.input.stage.status))
    }
}

/// Applies the configuration of the running commit again
pub struct RollbackExecutor {
    input: Input,
}

impl RollbackExecutor {
    async fn run(&self) -> StageStatus {
        let lw = self.input.lw();
        let Some(ds) = self.input.running_source().await else {
            return StageStatus::Failure;
        };
        lw.info(&format!(
            "Start rolling back to the state defined at commit {}",
            self.input.deployment.running_commit_hash
        ));
        let Some(cmd) = prepare(&self.input, &ds).await else {
            return StageStatus::Failure;
        };
        apply(&self.input, &cmd).await
    }
}

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        until_stopped(sig, self.run())
            .await
            .unwrap_or_else(|kind| status_on_stop(kind, self.input.stage.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::new_stop_signal;
    use crate::executor::testing::{input, NoCommands};
    use crate::model::PipelineStage;

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: TerraformApp\nspec: {}\n";

    #[tokio::test]
    async fn test_rollback_on_first_deployment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stage = PipelineStage::new("stage-1", StageName::Rollback, 1, 0);
        let (input, _) = input(dir.path(), dir.path(), stage, None, APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();

        let status = RollbackExecutor { input: input.clone() }.execute(&sig).await;
        assert_eq!(status, StageStatus::Failure);
        assert!(input.log.blocks()[0].log.contains("first deployment"));
    }

    #[tokio::test]
    async fn test_plan_without_platform_provider_fails() {
        let repo = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(repo.path().join("app")).await.unwrap();
        tokio::fs::write(repo.path().join("app/app.pipecd.yaml"), APP).await.unwrap();
        let stage = PipelineStage::new("stage-0", StageName::TerraformPlan, 0, 0);
        let (input, _) = input(repo.path(), work.path(), stage, None, APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();

        let status = DeployExecutor { input: input.clone() }.execute(&sig).await;
        assert_eq!(status, StageStatus::Failure);
        assert!(input
            .log
            .blocks()
            .iter()
            .any(|b| b.log.contains("Missing the platform provider name")));
    }
}
