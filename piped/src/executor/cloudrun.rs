//! CLOUDRUN_SYNC, CLOUDRUN_PROMOTE and Cloud Run rollback

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::stage::StageOptions;
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, until_stopped, Executor, Input, Registry, StopSignal};
use crate::logs::StageLogWriter;
use crate::model::{ApplicationKind, StageName, StageStatus};
use crate::platformprovider::cloudrun::{
    self, Client, RevisionTraffic, ServiceManifest, REVISION_READY_INTERVAL, REVISION_READY_TIMEOUT,
};

const PROMOTE_PERCENTAGE_KEY: &str = "promote-percentage";

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    let f: crate::executor::Factory = Arc::new(|input| Box::new(DeployExecutor { input }));
    r.register(StageName::CloudRunSync, f.clone())?;
    r.register(StageName::CloudRunPromote, f)?;
    r.register_rollback(
        ApplicationKind::CloudRun,
        Arc::new(|input| Box::new(RollbackExecutor { input })),
    )
}

async fn load_service_manifest(input: &Input, ds: &DeploySource) -> Option<ServiceManifest> {
    let lw = input.lw();
    let Some(spec) = ds.config.cloudrun_spec() else {
        lw.error("The application configuration is not a Cloud Run one");
        return None;
    };
    lw.info(&format!("Loading service manifest at the {} commit ({})", ds.revision_name, ds.revision));
    match ServiceManifest::load(&ds.app_dir, &spec.input.service_manifest_file).await {
        Ok(sm) => {
            lw.info(&format!("Successfully loaded the service manifest at the {} commit", ds.revision_name));
            Some(sm)
        }
        Err(e) => {
            lw.error(&format!("Failed to load service manifest file ({})", e));
            None
        }
    }
}

async fn client(input: &Input) -> Option<Arc<dyn Client>> {
    let provider = input.find_platform_provider()?;
    match input.clients.cloudrun(provider).await {
        Ok(c) => Some(c),
        Err(e) => {
            input
                .lw()
                .error(&format!("Unable to create Cloud Run client for the provider {} ({})", provider.name, e));
            None
        }
    }
}

fn decide_revision_name(sm: &ServiceManifest, commit: &str, lw: &dyn StageLogWriter) -> Option<String> {
    match sm.decide_revision_name(commit) {
        Ok(r) => Some(r),
        Err(e) => {
            lw.error(&format!("Unable to decide revision name for the commit {} ({})", commit, e));
            None
        }
    }
}

async fn revision_exists(client: &dyn Client, revision: &str, lw: &dyn StageLogWriter) -> Option<bool> {
    match client.get_revision(revision).await {
        Ok(_) => Some(true),
        Err(e) if e.is_not_found() => Some(false),
        Err(e) => {
            lw.error(&format!("Failed while checking the existence of revision {} ({})", revision, e));
            None
        }
    }
}

/// Name the new revision (empty when it already exists) and set the traffic
fn configure(
    input: &Input,
    sm: &mut ServiceManifest,
    commit: &str,
    revision: &str,
    traffic: &[RevisionTraffic],
) -> bool {
    let lw = input.lw();
    let d = &input.deployment;
    let result = cloudrun::add_builtin_labels(sm, &d.piped_id, &d.application_id, commit, revision)
        .and_then(|_| sm.set_revision(revision))
        .and_then(|_| sm.update_traffic(traffic));
    if let Err(e) = result {
        lw.error(&format!("Unable to configure the service manifest ({})", e));
        return false;
    }
    true
}

async fn apply_and_wait(client: &dyn Client, sm: &ServiceManifest, wait_for: &str, lw: &dyn StageLogWriter) -> bool {
    lw.info("Start applying the service manifest");
    if let Err(e) = cloudrun::apply(client, sm).await {
        lw.error(&format!("Failed to apply the service manifest ({})", e));
        return false;
    }
    lw.info(&format!("Waiting for revision {} to be ready", wait_for));
    if let Err(e) = cloudrun::wait_revision_ready(client, wait_for, REVISION_READY_INTERVAL, REVISION_READY_TIMEOUT).await {
        lw.error(&format!("Revision {} was not ready ({})", wait_for, e));
        return false;
    }
    lw.success("Successfully applied the service manifest");
    true
}

pub struct DeployExecutor {
    input: Input,
}

impl DeployExecutor {
    async fn ensure_sync(&self) -> StageStatus {
        let input = &self.input;
        let lw = input.lw();
        let Some(ds) = input.target_source().await else {
            return StageStatus::Failure;
        };
        let Some(mut sm) = load_service_manifest(input, &ds).await else {
            return StageStatus::Failure;
        };
        let Some(client) = client(input).await else {
            return StageStatus::Failure;
        };
        let commit = input.deployment.target_commit_hash();
        let Some(revision) = decide_revision_name(&sm, commit, lw) else {
            return StageStatus::Failure;
        };
        let Some(exists) = revision_exists(client.as_ref(), &revision, lw).await else {
            return StageStatus::Failure;
        };
        let new_revision = if exists {
            lw.info(&format!("Revision {} was already registered", revision));
            ""
        } else {
            revision.as_str()
        };

        if !configure(input, &mut sm, commit, new_revision, &[RevisionTraffic::new(revision.as_str(), 100)]) {
            return StageStatus::Failure;
        }
        if !apply_and_wait(client.as_ref(), &sm, &revision, lw).await {
            return StageStatus::Failure;
        }
        StageStatus::Success
    }

    async fn ensure_promote(&self) -> StageStatus {
        let input = &self.input;
        let lw = input.lw();
        let Some(StageOptions::CloudRunPromote(opts)) = input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", input.stage.name));
            return StageStatus::Failure;
        };
        if let Err(e) = input
            .stage_metadata()
            .put(PROMOTE_PERCENTAGE_KEY, &opts.percent.to_string())
            .await
        {
            lw.error(&format!("Failed to save the promote percentage to metadata ({})", e));
        }

        let Some(running) = input.running_source().await else {
            return StageStatus::Failure;
        };
        let Some(running_sm) = load_service_manifest(input, &running).await else {
            return StageStatus::Failure;
        };
        let Some(last_revision) =
            decide_revision_name(&running_sm, &input.deployment.running_commit_hash, lw)
        else {
            return StageStatus::Failure;
        };

        let Some(ds) = input.target_source().await else {
            return StageStatus::Failure;
        };
        let Some(mut sm) = load_service_manifest(input, &ds).await else {
            return StageStatus::Failure;
        };
        let commit = input.deployment.target_commit_hash();
        let Some(revision) = decide_revision_name(&sm, commit, lw) else {
            return StageStatus::Failure;
        };
        let Some(client) = client(input).await else {
            return StageStatus::Failure;
        };

        let traffic = [
            RevisionTraffic::new(revision.as_str(), opts.percent),
            RevisionTraffic::new(last_revision.as_str(), 100 - opts.percent),
        ];
        let Some(exists) = revision_exists(client.as_ref(), &revision, lw).await else {
            return StageStatus::Failure;
        };
        let new_revision = if exists {
            lw.info(&format!("Revision {} was already registered", revision));
            ""
        } else {
            revision.as_str()
        };
        if !configure(input, &mut sm, commit, new_revision, &traffic) {
            return StageStatus::Failure;
        }
        lw.info(&format!(
            "Routing {}% of traffic to {} and {}% to {}",
            opts.percent,
            revision,
            100 - opts.percent,
            last_revision
        ));
        if !apply_and_wait(client.as_ref(), &sm, &revision, lw).await {
            return StageStatus::Failure;
        }
        StageStatus::Success
    }
}

#[async_trait]
impl Executor for DeployExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let work = async {
            match self.input.stage.name {
                StageName::CloudRunSync => self.ensure_sync().await,
                StageName::CloudRunPromote => self.ensure_promote().await,
                other => {
                    self.input
                        .lw()
                        .error(&format!("Unsupported stage {} for cloudrun application", other));
                    StageStatus::Failure
                }
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

impl RollbackExecutor {
    async fn ensure_rollback(&self) -> StageStatus {
        let input = &self.input;
        let lw = input.lw();
        let Some(ds) = input.running_source().await else {
            return StageStatus::Failure;
        };
        let Some(mut sm) = load_service_manifest(input, &ds).await else {
            return StageStatus::Failure;
        };
        let commit = input.deployment.running_commit_hash.as_str();
        let Some(revision) = decide_revision_name(&sm, commit, lw) else {
            return StageStatus::Failure;
        };
        let Some(client) = client(input).await else {
            return StageStatus::Failure;
        };
        let Some(exists) = revision_exists(client.as_ref(), &revision, lw).await else {
            return StageStatus::Failure;
        };
        let new_revision = if exists { "" } else { revision.as_str() };
        if !configure(input, &mut sm, commit, new_revision, &[RevisionTraffic::new(revision.as_str(), 100)]) {
            return StageStatus::Failure;
        }
        lw.info(&format!("Rolling back all traffic to revision {}", revision));
        if !apply_and_wait(client.as_ref(), &sm, &revision, lw).await {
            return StageStatus::Failure;
        }
        StageStatus::Success
    }
}

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        until_stopped(sig, self.ensure_rollback())
            .await
            .unwrap_or_else(|kind| status_on_stop(kind, self.input.stage.status))
    }
}
