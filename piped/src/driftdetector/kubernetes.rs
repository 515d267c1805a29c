use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Drift, HeadSource, StateChecker};
use crate::app::state::AppState;
use crate::config::piped::PlatformProvider;
use crate::diff::Options;
use crate::errors::PipedError;
use crate::model::{Application, DEFAULT_APPLICATION_CONFIG_FILENAME};
use crate::platformprovider::kubernetes::{
    application_selector, diff_list, load_manifests, DiffListResult, DiffRenderOptions, Manifest,
};

const MAX_PRINTED_CHANGES: usize = 3;

pub struct Checker {
    state: Arc<AppState>,
    provider: PlatformProvider,
}

impl Checker {
    pub fn new(state: Arc<AppState>, provider: PlatformProvider) -> Self {
        Self { state, provider }
    }

    /// Manifests declared at the head commit with the kubectl version they ask for
    async fn head_manifests(
        &self,
        app: &Application,
        head: &HeadSource<'_>,
    ) -> Result<(Arc<Vec<Manifest>>, String), PipedError> {
        let source = head.load(false).await?;
        let spec = source.config.kubernetes_spec().ok_or_else(|| {
            PipedError::Config("missing KubernetesApplicationSpec in application configuration".to_string())
        })?;
        let version = spec.input.kubectl_version.clone();
        if let Some(manifests) = self.state.manifests_cache.get(&app.id, head.commit) {
            return Ok((manifests, version));
        }
        let filename = match app.git_path.config_filename.as_str() {
            "" => DEFAULT_APPLICATION_CONFIG_FILENAME,
            name => name,
        };
        let manifests = load_manifests(&source.app_dir, filename, &spec.input).await?;
        Ok((self.state.manifests_cache.put(&app.id, head.commit, manifests), version))
    }
}

#[async_trait]
impl StateChecker for Checker {
    async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError> {
        let (declared, kubectl_version) = self.head_manifests(app, head).await?;
        let applier = self.state.clients.kubernetes(&self.provider, &kubectl_version).await?;
        let live: Vec<Manifest> = applier
            .get_managed_manifests(&application_selector(&app.id))
            .await?
            .into_iter()
            .filter(|m| m.nested(&["metadata", "ownerReferences"]).is_none())
            .collect();
        debug!(
            "Application {} has {} manifests at commit {} and {} live ones",
            app.id,
            declared.len(),
            head.commit,
            live.len()
        );

        let result = diff_list(&declared, &live, &Options::live_state());
        if result.no_change() {
            return Ok(Drift::None);
        }
        Ok(Drift::Detected {
            short_reason: short_reason(&result),
            details: render(&result).await,
        })
    }
}

/// Declared-only manifests are what the next sync adds, live-only ones what it deletes
fn short_reason(result: &DiffListResult) -> String {
    format!(
        "There are {} manifests not synced ({} adds, {} deletes, {} changes)",
        result.total_count(),
        result.deletes.len(),
        result.adds.len(),
        result.changes.len()
    )
}

async fn render(result: &DiffListResult) -> String {
    let options = DiffRenderOptions {
        mask_secret: true,
        mask_configmap: false,
        max_changed_manifests: MAX_PRINTED_CHANGES,
        use_diff_command: false,
    };
    format!("--- Git\n+++ Cluster\n\n{}", result.render(&options).await)
}
