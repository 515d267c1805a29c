//! K8S_SYNC and Kubernetes rollback

use std::sync::Arc;

use async_trait::async_trait;

use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, until_stopped, Executor, Input, Registry, StopSignal};
use crate::model::{ApplicationKind, StageName, StageStatus, DEFAULT_APPLICATION_CONFIG_FILENAME};
use crate::platformprovider::kubernetes::{add_builtin_labels, load_manifests, sync_manifests};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::K8sSync, Arc::new(|input| Box::new(SyncExecutor { input })))?;
    r.register_rollback(
        ApplicationKind::Kubernetes,
        Arc::new(|input| Box::new(RollbackExecutor { input })),
    )
}

/// Apply every manifest of `ds`, labelled with `commit`
async fn apply_source(input: &Input, ds: &DeploySource, commit: &str) -> bool {
    let lw = input.lw();
    let Some(provider) = input.find_platform_provider() else {
        return false;
    };
    let Some(spec) = ds.config.kubernetes_spec() else {
        lw.error("The application configuration is not a Kubernetes one");
        return false;
    };

    let filename = match input.deployment.git_path.config_filename.as_str() {
        "" => DEFAULT_APPLICATION_CONFIG_FILENAME,
        name => name,
    };
    let mut manifests = match load_manifests(&ds.app_dir, filename, &spec.input).await {
        Ok(m) => m,
        Err(e) => {
            lw.error(&format!("Failed while loading manifests ({})", e));
            return false;
        }
    };
    if manifests.is_empty() {
        lw.error("There are no kubernetes manifests to handle");
        return false;
    }
    lw.info(&format!("Successfully loaded {} manifests", manifests.len()));
    add_builtin_labels(&mut manifests, &input.deployment.piped_id, &input.deployment.application_id, commit);

    let applier = match input.clients.kubernetes(provider, &spec.input.kubectl_version).await {
        Ok(a) => a,
        Err(e) => {
            lw.error(&format!("Unable to prepare kubectl for {} ({})", provider.name, e));
            return false;
        }
    };

    lw.info("Start applying the manifests");
    match sync_manifests(
        applier.as_ref(),
        &manifests,
        &input.deployment.application_id,
        spec.quick_sync.prune,
    )
    .await
    {
        Ok(pruned) => {
            for key in &pruned {
                lw.info(&format!("Deleted resource {} since it is no longer declared", key));
            }
            lw.success(&format!("Successfully applied {} manifests", manifests.len()));
            true
        }
        Err(e) => {
            lw.error(&format!("Failed while applying manifests ({})", e));
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
            let commit = self.input.deployment.target_commit_hash();
            if apply_source(&self.input, &ds, commit).await {
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
            let commit = self.input.deployment.running_commit_hash.as_str();
            let Some(ds) = self.input.running_source().await else {
                return StageStatus::Failure;
            };
            self.input
                .lw()
                .info(&format!("Rolling back to the running commit {}", commit));
            if apply_source(&self.input, &ds, commit).await {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::new_stop_signal;
    use crate::executor::testing::{bind_platform_provider, input, NoCommands};
    use crate::model::PipelineStage;
    use crate::platformprovider::kubernetes::{Applier, Manifest, ResourceKey};
    use std::sync::Mutex;

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";
    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 2\n";

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<Manifest>>,
    }

    #[async_trait]
    impl Applier for RecordingApplier {
        async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), PipedError> {
            self.applied.lock().unwrap().push(manifest.clone());
            Ok(())
        }

        async fn delete_resource(&self, key: &ResourceKey) -> Result<(), PipedError> {
            Err(PipedError::NotFound(key.to_string()))
        }

        async fn get_managed_manifests(&self, _selector: &str) -> Result<Vec<Manifest>, PipedError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_sync_applies_labelled_manifests() {
        let repo = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(repo.path().join("app")).await.unwrap();
        tokio::fs::write(repo.path().join("app/app.pipecd.yaml"), APP).await.unwrap();
        tokio::fs::write(repo.path().join("app/deployment.yaml"), DEPLOYMENT).await.unwrap();
        let stage = PipelineStage::new("stage-0", StageName::K8sSync, 0, 0);
        let (mut input, _) = input(repo.path(), work.path(), stage, None, APP, Arc::new(NoCommands)).await;
        bind_platform_provider(&mut input, "kubernetes-dev", "");
        let applier = Arc::new(RecordingApplier::default());
        // Clients are keyed by provider and kubectl version, empty here
        input.clients.kubernetes.insert("kubernetes-dev@", applier.clone()).unwrap();
        let (_handler, sig) = new_stop_signal();

        let status = SyncExecutor { input }.execute(&sig).await;
        assert_eq!(status, StageStatus::Success);
        let applied = applier.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name(), "web");
        let labels = applied[0].labels();
        assert_eq!(labels.get("pipecd.dev/commit-hash").map(String::as_str), Some("0123456789abcdef"));
        assert_eq!(labels.get("pipecd.dev/application").map(String::as_str), Some("app-1"));
    }

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
    async fn test_sync_without_platform_provider_fails() {
        let repo = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(repo.path().join("app")).await.unwrap();
        tokio::fs::write(repo.path().join("app/app.pipecd.yaml"), APP).await.unwrap();
        let stage = PipelineStage::new("stage-0", StageName::K8sSync, 0, 0);
        let (input, _) = input(repo.path(), work.path(), stage, None, APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();

        let status = SyncExecutor { input: input.clone() }.execute(&sig).await;
        assert_eq!(status, StageStatus::Failure);
        assert!(input
            .log
            .blocks()
            .iter()
            .any(|b| b.log.contains("Missing the platform provider name")));
    }
}
