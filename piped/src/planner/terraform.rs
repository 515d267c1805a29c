//! Terraform planner
//!
//! Terraform changes cannot be compared without running `plan`, so once the
//! shared checks pass the configured pipeline is always used.

use async_trait::async_trait;
use tracing::warn;

use super::{build_output, decide_common, Decision, Input, Output, Planner, QuickSyncSummaries};
use crate::errors::PipedError;
use crate::platformprovider::terraform::{find_artifact_versions, load_terraform_files};

pub struct TerraformPlanner;

const QUICK_SYNC_SUMMARY: &str =
    "Quick sync by automatically applying any detected changes because no pipeline was configured";

#[async_trait]
impl Planner for TerraformPlanner {
    async fn plan(&self, input: &Input) -> Result<Output, PipedError> {
        let ds = input.target_source().await?;
        let spec = ds.config.terraform_spec().ok_or_else(|| {
            PipedError::Config("missing TerraformApplicationSpec in application configuration".to_string())
        })?;
        let generic = &ds.config.generic;

        let versions = match load_terraform_files(&ds.app_dir).await {
            Ok(files) => find_artifact_versions(&files, &input.deployment.git_path, &ds.repo_dir, &ds.app_dir),
            Err(e) => {
                warn!("Unable to determine the modules of deployment {}: {}", input.deployment.id, e);
                Vec::new()
            }
        };

        let summaries = QuickSyncSummaries {
            no_pipeline: QUICK_SYNC_SUMMARY.to_string(),
            first_deployment: "Quick sync by automatically applying any detected changes because it seems this is the first deployment".to_string(),
        };
        let decision = decide_common(input, generic, summaries)?
            .unwrap_or_else(|| Decision::pipeline("Sync with the specified pipeline"));
        Ok(build_output(input, decision, generic, spec.input.auto_rollback, versions))
    }
}
