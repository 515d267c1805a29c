//! LAMBDA_SYNC, LAMBDA_CANARY_ROLLOUT, LAMBDA_PROMOTE and Lambda rollback
//!
//! A canary rollout only publishes a new version and remembers it in the
//! shared metadata. Promotions then move alias traffic to that version. The
//! alias routing seen before the first change of a deployment is saved under
//! `original-traffic-{runningCommit}` so a rollback can restore it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::stage::StageOptions;
use crate::deploysource::DeploySource;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, until_stopped, Executor, Input, Registry, StopSignal};
use crate::logs::StageLogWriter;
use crate::model::{ApplicationKind, StageName, StageStatus};
use crate::platformprovider::lambda::{package_source, Client, FunctionManifest, RoutingTrafficConfig, SourceCode};
use crate::utils::Retry;

const PUBLISH_RETRY: u32 = 3;
const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const PROMOTE_PERCENTAGE_KEY: &str = "promote-percentage";

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    let f: crate::executor::Factory = Arc::new(|input| Box::new(DeployExecutor { input }));
    r.register(StageName::LambdaSync, f.clone())?;
    r.register(StageName::LambdaCanaryRollout, f.clone())?;
    r.register(StageName::LambdaPromote, f)?;
    r.register_rollback(
        ApplicationKind::Lambda,
        Arc::new(|input| Box::new(RollbackExecutor { input })),
    )
}

fn original_traffic_key(running_commit: &str) -> String {
    format!("original-traffic-{}", running_commit)
}

fn rollout_version_key(function_name: &str) -> String {
    format!("{}-rollout", function_name)
}

async fn load_function_manifest(input: &Input, ds: &DeploySource) -> Option<FunctionManifest> {
    let lw = input.lw();
    let Some(spec) = ds.config.lambda_spec() else {
        lw.error("The application configuration is not a Lambda one");
        return None;
    };
    lw.info(&format!("Loading function manifest at the {} commit ({})", ds.revision_name, ds.revision));
    match FunctionManifest::load(&ds.app_dir, &spec.input.function_manifest_file).await {
        Ok(fm) => {
            lw.info(&format!("Successfully loaded the lambda function manifest at the {} commit", ds.revision_name));
            Some(fm)
        }
        Err(e) => {
            lw.error(&format!("Failed to load lambda function manifest ({})", e));
            None
        }
    }
}

async fn client(input: &Input) -> Option<Arc<dyn Client>> {
    let provider = input.find_platform_provider()?;
    match input.clients.lambda(provider).await {
        Ok(c) => Some(c),
        Err(e) => {
            input
                .lw()
                .error(&format!("Unable to create Lambda client for the provider {} ({})", provider.name, e));
            None
        }
    }
}

/// Clone the function source at its reference and zip the configured path.
/// The returned directory owns the archive.
async fn prepare_source_archive(input: &Input, src: &SourceCode) -> Result<(TempDir, PathBuf), PipedError> {
    tokio::fs::create_dir_all(&input.working_dir).await?;
    let dir = tempfile::Builder::new()
        .prefix("lambda-source-")
        .tempdir_in(&input.working_dir)?;
    let repo = input
        .git_client
        .clone_repo(&src.git, &src.git, "", &dir.path().join("repo"))
        .await?;
    repo.checkout(&src.reference).await?;
    let archive = dir.path().join("source.zip");
    package_source(&repo.path().join(&src.path), &archive).await?;
    Ok((dir, archive))
}

/// Create or update the function then publish it, returning the new version
async fn build(input: &Input, client: &dyn Client, fm: &FunctionManifest) -> Option<String> {
    let lw = input.lw();
    let name = &fm.spec.name;
    let exists = match client.is_function_exist(name).await {
        Ok(found) => found,
        Err(e) => {
            lw.error(&format!("Unable to validate function name {} ({})", name, e));
            return None;
        }
    };

    let archive = if fm.spec.source_code.git.is_empty() {
        None
    } else {
        lw.info(&format!(
            "Packaging the function source from {} at {}",
            fm.spec.source_code.git, fm.spec.source_code.reference
        ));
        match prepare_source_archive(input, &fm.spec.source_code).await {
            Ok(a) => Some(a),
            Err(e) => {
                lw.error(&format!("Failed to prepare the function source ({})", e));
                return None;
            }
        }
    };

    let result = match (&archive, exists) {
        (Some((_, zip)), true) => client.update_function_from_source(fm, zip).await,
        (Some((_, zip)), false) => client.create_function_from_source(fm, zip).await,
        (None, true) => client.update_function(fm).await,
        (None, false) => client.create_function(fm).await,
    };
    if let Err(e) = result {
        let action = if exists { "update" } else { "create" };
        lw.error(&format!("Failed to {} lambda function {} ({})", action, name, e));
        return None;
    }

    lw.info("Waiting to update lambda function in progress...");
    let retry = Retry::constant(PUBLISH_RETRY, PUBLISH_RETRY_INTERVAL);
    match retry.run(|| async move { client.publish_function(fm).await }).await {
        Ok(version) => {
            lw.info(&format!("Published new version {} for Lambda function {}", version, name));
            Some(version)
        }
        Err(e) => {
            lw.error(&format!("Failed to commit new version for Lambda function {} ({})", name, e));
            None
        }
    }
}

/// Current alias routing, `None` when the alias does not exist yet. The first
/// routing read in a deployment is kept in the shared metadata.
async fn snapshot_traffic(
    input: &Input,
    client: &dyn Client,
    fm: &FunctionManifest,
) -> Result<Option<RoutingTrafficConfig>, ()> {
    let lw = input.lw();
    let cfg = match client.get_traffic_config(fm).await {
        Ok(cfg) => cfg,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => {
            lw.error(&format!("Failed to prepare traffic routing for Lambda function {} ({})", fm.spec.name, e));
            return Err(());
        }
    };

    let running = &input.deployment.running_commit_hash;
    if running.is_empty() {
        return Ok(Some(cfg));
    }
    let key = original_traffic_key(running);
    let shared = input.metadata.shared();
    if shared.get(&key).is_none() {
        let encoded = match cfg.encode() {
            Ok(v) => v,
            Err(e) => {
                lw.error(&format!("Unable to encode the traffic config ({})", e));
                return Err(());
            }
        };
        if let Err(e) = shared.put(&key, &encoded).await {
            lw.error(&format!("Unable to store the original traffic config ({})", e));
            return Err(());
        }
    }
    Ok(Some(cfg))
}

async fn update_traffic(client: &dyn Client, fm: &FunctionManifest, cfg: &RoutingTrafficConfig, lw: &dyn StageLogWriter) -> bool {
    match client.update_traffic_config(fm, cfg).await {
        Ok(()) => true,
        Err(e) => {
            lw.error(&format!("Failed to update traffic routing for Lambda function {} ({})", fm.spec.name, e));
            false
        }
    }
}

pub struct DeployExecutor {
    input: Input,
}

impl DeployExecutor {
    async fn ensure_sync(&self, client: &dyn Client, fm: &FunctionManifest) -> StageStatus {
        let lw = self.input.lw();
        lw.info("Start applying the lambda function manifest");
        let Some(version) = build(&self.input, client, fm).await else {
            return StageStatus::Failure;
        };
        let Ok(current) = snapshot_traffic(&self.input, client, fm).await else {
            return StageStatus::Failure;
        };
        match current {
            None => {
                if let Err(e) = client.create_traffic_config(fm, &version).await {
                    lw.error(&format!(
                        "Failed to create traffic routing for Lambda function {} (version: {}) ({})",
                        fm.spec.name, version, e
                    ));
                    return StageStatus::Failure;
                }
            }
            Some(_) => {
                if !update_traffic(client, fm, &RoutingTrafficConfig::all_to(version.as_str()), lw).await {
                    return StageStatus::Failure;
                }
            }
        }
        lw.success("Successfully applied the lambda function manifest");
        StageStatus::Success
    }

    async fn ensure_rollout(&self, client: &dyn Client, fm: &FunctionManifest) -> StageStatus {
        let lw = self.input.lw();
        lw.info("Start rolling out the lambda function");
        let Some(version) = build(&self.input, client, fm).await else {
            return StageStatus::Failure;
        };
        if let Err(e) = self
            .input
            .metadata
            .shared()
            .put(&rollout_version_key(&fm.spec.name), &version)
            .await
        {
            lw.error(&format!("Failed to store the rolled out version to metadata ({})", e));
            return StageStatus::Failure;
        }
        lw.success(&format!("Successfully rolled out version {} of {}", version, fm.spec.name));
        StageStatus::Success
    }

    async fn ensure_promote(&self, client: &dyn Client, fm: &FunctionManifest, percent: u32) -> StageStatus {
        let lw = self.input.lw();
        let Some(version) = self.input.metadata.shared().get(&rollout_version_key(&fm.spec.name)) else {
            lw.error(&format!(
                "No rolled out version of {} was found, a {} stage must run first",
                fm.spec.name,
                StageName::LambdaCanaryRollout
            ));
            return StageStatus::Failure;
        };
        let mut cfg = match snapshot_traffic(&self.input, client, fm).await {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                lw.error(&format!("The traffic alias of {} does not exist yet", fm.spec.name));
                return StageStatus::Failure;
            }
            Err(()) => return StageStatus::Failure,
        };

        if !cfg.configure(&version, percent) {
            lw.error("The current traffic routing has no primary version");
            return StageStatus::Failure;
        }
        lw.info(&format!("Routing {}% of traffic to version {}", percent, version));
        if !update_traffic(client, fm, &cfg, lw).await {
            return StageStatus::Failure;
        }
        lw.success(&format!("Successfully promoted version {} to {}% of traffic", version, percent));
        StageStatus::Success
    }

    async fn run(&self) -> StageStatus {
        let lw = self.input.lw();
        let promote_percent = match (self.input.stage.name, self.input.stage_options()) {
            (StageName::LambdaPromote, Some(StageOptions::LambdaPromote(o))) => Some(o.percent),
            (StageName::LambdaPromote, _) => {
                lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
                return StageStatus::Failure;
            }
            _ => None,
        };
        if let Some(percent) = promote_percent {
            if let Err(e) = self
                .input
                .stage_metadata()
                .put(PROMOTE_PERCENTAGE_KEY, &percent.to_string())
                .await
            {
                lw.error(&format!("Failed to save the promote percentage to metadata ({})", e));
            }
        }

        let Some(ds) = self.input.target_source().await else {
            return StageStatus::Failure;
        };
        let Some(fm) = load_function_manifest(&self.input, &ds).await else {
            return StageStatus::Failure;
        };
        let Some(client) = client(&self.input).await else {
            return StageStatus::Failure;
        };
        match (self.input.stage.name, promote_percent) {
            (StageName::LambdaSync, _) => self.ensure_sync(client.as_ref(), &fm).await,
            (StageName::LambdaCanaryRollout, _) => self.ensure_rollout(client.as_ref(), &fm).await,
            (StageName::LambdaPromote, Some(p)) => self.ensure_promote(client.as_ref(), &fm, p).await,
            (other, _) => {
                lw.error(&format!("Unsupported stage {} for lambda application", other));
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

/// Restores the alias routing saved before the deployment changed it
pub struct RollbackExecutor {
    input: Input,
}

impl RollbackExecutor {
    async fn run(&self) -> StageStatus {
        let lw = self.input.lw();
        let Some(ds) = self.input.running_source().await else {
            return StageStatus::Failure;
        };
        let Some(fm) = load_function_manifest(&self.input, &ds).await else {
            return StageStatus::Failure;
        };

        let key = original_traffic_key(&self.input.deployment.running_commit_hash);
        let Some(raw) = self.input.metadata.shared().get(&key) else {
            lw.error("No original traffic config was saved for this deployment, nothing to roll back");
            return StageStatus::Failure;
        };
        let original = match RoutingTrafficConfig::decode(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                lw.error(&format!("Unable to decode the original traffic config ({})", e));
                return StageStatus::Failure;
            }
        };
        let restored = match (&original.primary, &original.secondary) {
            (Some(_), Some(_)) => original.clone(),
            // Zero out any promoted version by pointing everything at the primary
            (Some(primary), None) => RoutingTrafficConfig::all_to(primary.version.as_str()),
            (None, _) => {
                lw.error("The original traffic config has no primary version");
                return StageStatus::Failure;
            }
        };

        let Some(client) = client(&self.input).await else {
            return StageStatus::Failure;
        };
        lw.info(&format!("Restoring the traffic routing of {} to {}", fm.spec.name, raw));
        if !update_traffic(client.as_ref(), &fm, &restored, lw).await {
            return StageStatus::Failure;
        }
        lw.success("Successfully rolled back the traffic routing");
        StageStatus::Success
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
