//! Cloud Run planner

use async_trait::async_trait;
use tracing::warn;

use super::{build_output, decide_common, Decision, Input, Output, Planner, QuickSyncSummaries};
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::model::artifact::summarize_versions;
use crate::model::ArtifactVersion;
use crate::platformprovider::cloudrun::{determine_versions, ServiceManifest};

pub struct CloudRunPlanner;

async fn load_versions(ds: &DeploySource, file: &str) -> Result<Vec<ArtifactVersion>, PipedError> {
    let sm = ServiceManifest::load(&ds.app_dir, file).await?;
    determine_versions(&sm)
}

#[async_trait]
impl Planner for CloudRunPlanner {
    async fn plan(&self, input: &Input) -> Result<Output, PipedError> {
        let ds = input.target_source().await?;
        let spec = ds.config.cloudrun_spec().ok_or_else(|| {
            PipedError::Config("missing CloudRunApplicationSpec in application configuration".to_string())
        })?;
        let generic = &ds.config.generic;
        let file = spec.input.service_manifest_file.as_str();

        let versions = match load_versions(&ds, file).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Unable to determine the target versions of deployment {}: {}", input.deployment.id, e);
                Vec::new()
            }
        };
        let version = if versions.is_empty() {
            "unknown".to_string()
        } else {
            summarize_versions(&versions)
        };

        let summaries = QuickSyncSummaries {
            no_pipeline: format!(
                "Quick sync to deploy image {} and configure all traffic to it (pipeline was not configured)",
                version
            ),
            first_deployment: format!(
                "Quick sync to deploy image {} and configure all traffic to it (it seems this is the first deployment)",
                version
            ),
        };
        if let Some(decision) = decide_common(input, generic, summaries)? {
            return Ok(build_output(input, decision, generic, spec.input.auto_rollback, versions));
        }

        let decision = match input.running_source().await {
            Ok(running) => match load_versions(&running, file).await {
                Ok(last) => Decision::pipeline(format!(
                    "Sync with pipeline to update image from {} to {}",
                    summarize_versions(&last),
                    version
                )),
                Err(_) => Decision::pipeline("Sync with the specified pipeline"),
            },
            Err(_) => Decision::pipeline("Sync with the specified pipeline"),
        };
        Ok(build_output(input, decision, generic, spec.input.auto_rollback, versions))
    }
}
