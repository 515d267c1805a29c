//! ECS planner

use async_trait::async_trait;
use tracing::warn;

use super::{build_output, decide_common, Decision, Input, Output, Planner, QuickSyncSummaries};
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::model::artifact::summarize_versions;
use crate::model::ArtifactVersion;
use crate::platformprovider::ecs::TaskDefinition;

pub struct EcsPlanner;

async fn load_versions(ds: &DeploySource, file: &str) -> Result<Vec<ArtifactVersion>, PipedError> {
    Ok(TaskDefinition::load(&ds.app_dir, file).await?.artifact_versions())
}

#[async_trait]
impl Planner for EcsPlanner {
    async fn plan(&self, input: &Input) -> Result<Output, PipedError> {
        let ds = input.target_source().await?;
        let spec = ds.config.ecs_spec().ok_or_else(|| {
            PipedError::Config("missing ECSApplicationSpec in application configuration".to_string())
        })?;
        let generic = &ds.config.generic;
        let file = spec.input.task_definition_file.as_str();

        let versions = load_versions(&ds, file).await.unwrap_or_else(|e| {
            warn!("Unable to determine the target versions of deployment {}: {}", input.deployment.id, e);
            Vec::new()
        });
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

        let last = match input.running_source().await {
            Ok(running) => load_versions(&running, file).await.ok().filter(|v| !v.is_empty()),
            Err(_) => None,
        };
        let decision = match last {
            Some(last) => Decision::pipeline(format!(
                "Sync with pipeline to update image from {} to {}",
                summarize_versions(&last),
                version
            )),
            None => Decision::pipeline("Sync with the specified pipeline"),
        };
        Ok(build_output(input, decision, generic, spec.input.auto_rollback, versions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApplicationKind, StageName, SyncStrategy};
    use crate::planner::testing::{input, write_app};

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: ECSApp\nspec: {}\n";
    const TASKDEF: &str = r#"
family: web
containerDefinitions:
  - name: web
    image: nginx:1.25
  - name: sidecar
    image: envoy:v1.29
"#;

    #[tokio::test]
    async fn test_versions_come_from_every_container() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_app(target.path(), &[("app.pipecd.yaml", APP), ("taskdef.yaml", TASKDEF)]).await;
        let input = input(ApplicationKind::Ecs, work.path(), target.path(), None);

        let out = EcsPlanner.plan(&input).await.unwrap();
        assert_eq!(out.sync_strategy, SyncStrategy::QuickSync);
        assert_eq!(out.stages[0].name, StageName::EcsSync);
        assert_eq!(out.versions.len(), 2);
        assert_eq!(out.version, "1.25, v1.29");
    }

    #[tokio::test]
    async fn test_missing_task_definition_reports_unknown() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_app(target.path(), &[("app.pipecd.yaml", APP)]).await;
        let input = input(ApplicationKind::Ecs, work.path(), target.path(), None);

        let out = EcsPlanner.plan(&input).await.unwrap();
        assert_eq!(out.versions, [ArtifactVersion::unknown()]);
        assert_eq!(out.version, "unknown");
        assert!(out.summary.contains("image unknown"));
    }
}
