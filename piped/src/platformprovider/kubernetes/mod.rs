//! Kubernetes adapter: manifest loading, resource diffing and `kubectl` apply

mod diff;
mod kubectl;
mod loader;
mod manifest;
mod resourcekey;
mod strategy;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use diff::{diff_list, diff_manifests, DiffChange, DiffListResult, DiffRenderOptions};
pub use kubectl::Kubectl;
pub use loader::load_manifests;
pub use manifest::{parse_manifests, Manifest};
pub use resourcekey::{ResourceKey, DEFAULT_NAMESPACE, KIND_CONFIGMAP, KIND_DEPLOYMENT, KIND_SECRET};
pub use strategy::{decide_strategy, determine_versions, find_workloads};

use crate::errors::PipedError;

pub const LABEL_PREFIX: &str = "pipecd.dev/";

/// Operations piped needs on a cluster
#[async_trait]
pub trait Applier: Send + Sync {
    /// Create or update the resource, idempotent
    async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), PipedError>;

    async fn delete_resource(&self, key: &ResourceKey) -> Result<(), PipedError>;

    /// Live manifests of the resources matching the label `selector`
    async fn get_managed_manifests(&self, selector: &str) -> Result<Vec<Manifest>, PipedError>;
}

/// Label selector matching every resource piped applied for `app_id`
pub fn application_selector(app_id: &str) -> String {
    format!(
        "{},{}{}={}",
        super::managed_by_piped_selector(LABEL_PREFIX),
        LABEL_PREFIX,
        super::LABEL_APPLICATION,
        app_id
    )
}

/// Add the builtin labels to every manifest
pub fn add_builtin_labels(manifests: &mut [Manifest], piped_id: &str, app_id: &str, commit: &str) {
    let labels: BTreeMap<String, String> = super::builtin_labels(LABEL_PREFIX, piped_id, app_id, commit);
    for m in manifests {
        m.add_labels(&labels);
    }
}

/// Apply every manifest, then delete the managed resources no longer declared when `prune` is set.
/// Returns the keys of the pruned resources.
pub async fn sync_manifests(
    applier: &dyn Applier,
    manifests: &[Manifest],
    app_id: &str,
    prune: bool,
) -> Result<Vec<ResourceKey>, PipedError> {
    for m in manifests {
        applier.apply_manifest(m).await?;
    }
    if !prune {
        return Ok(Vec::new());
    }

    let live = applier.get_managed_manifests(&application_selector(app_id)).await?;
    let mut pruned = Vec::new();
    for l in live {
        // Objects created by controllers (ReplicaSets of a Deployment...) are not ours to prune
        if l.key.is_replicaset() {
            continue;
        }
        if manifests.iter().any(|m| m.key.without_version() == l.key.without_version()) {
            continue;
        }
        match applier.delete_resource(&l.key).await {
            Ok(()) => pruned.push(l.key),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(pruned)
}
