//! Kubernetes planner
//!
//! Compares the workloads of the running and target commits to choose between
//! applying everything at once and running the configured pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{build_output, decide_common, Decision, Input, Output, Planner, QuickSyncSummaries};
use crate::config::application::KubernetesDeploymentInput;
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::model::DEFAULT_APPLICATION_CONFIG_FILENAME;
use crate::platformprovider::kubernetes::{decide_strategy, determine_versions, load_manifests, Manifest};

pub struct KubernetesPlanner;

/// Manifests of `ds`, loaded once per `(application, commit)`
async fn cached_manifests(
    input: &Input,
    ds: &DeploySource,
    commit: &str,
    spec: &KubernetesDeploymentInput,
) -> Result<Arc<Vec<Manifest>>, PipedError> {
    let app_id = &input.deployment.application_id;
    if let Some(manifests) = input.manifests_cache.get(app_id, commit) {
        return Ok(manifests);
    }
    let filename = match input.deployment.git_path.config_filename.as_str() {
        "" => DEFAULT_APPLICATION_CONFIG_FILENAME,
        name => name,
    };
    let manifests = load_manifests(&ds.app_dir, filename, spec).await?;
    Ok(input.manifests_cache.put(app_id, commit, manifests))
}

#[async_trait]
impl Planner for KubernetesPlanner {
    async fn plan(&self, input: &Input) -> Result<Output, PipedError> {
        let ds = input.target_source().await?;
        let spec = ds.config.kubernetes_spec().ok_or_else(|| {
            PipedError::Config("missing KubernetesApplicationSpec in application configuration".to_string())
        })?;
        let generic = &ds.config.generic;
        let auto_rollback = spec.input.auto_rollback;

        let news = cached_manifests(input, &ds, input.deployment.target_commit_hash(), &spec.input)
            .await
            .map_err(|e| PipedError::Config(format!("failed to load new manifests ({})", e)))?;
        let versions = determine_versions(&news);
        if versions.is_empty() {
            warn!(
                "Unable to determine the container images of deployment {}",
                input.deployment.id
            );
        }

        if let Some(decision) = decide_common(input, generic, QuickSyncSummaries::default())? {
            return Ok(build_output(input, decision, generic, auto_rollback, versions));
        }

        let running_commit = input.most_recent_successful_commit_hash.as_str();
        let olds = match input.manifests_cache.get(&input.deployment.application_id, running_commit) {
            Some(olds) => olds,
            None => {
                let running = input.running_source().await?;
                cached_manifests(input, &running, running_commit, &spec.input)
                    .await
                    .map_err(|e| {
                        PipedError::Config(format!("failed to load previously deployed manifests ({})", e))
                    })?
            }
        };

        let (progressive, summary) = decide_strategy(&olds, &news, &spec.workloads);
        let decision = if progressive {
            Decision::pipeline(summary)
        } else {
            Decision::quick_sync(summary)
        };
        Ok(build_output(input, decision, generic, auto_rollback, versions))
    }
}
