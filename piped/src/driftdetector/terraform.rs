use std::sync::Arc;

use async_trait::async_trait;

use super::{Drift, HeadSource, StateChecker};
use crate::app::state::AppState;
use crate::config::piped::{PlatformProvider, PlatformProviderConfig};
use crate::errors::PipedError;
use crate::logs::TracingLogWriter;
use crate::model::Application;
use crate::platformprovider::terraform::{Options, PlanResult, Terraform};

/// Runs `terraform plan` against the head commit; any planned change is a drift
pub struct Checker {
    state: Arc<AppState>,
    provider: PlatformProvider,
}

impl Checker {
    pub fn new(state: Arc<AppState>, provider: PlatformProvider) -> Self {
        Self { state, provider }
    }
}

/// Terraform providers take part unless `driftDetectionEnabled` is explicitly false
pub fn enabled(provider: &PlatformProvider) -> bool {
    match &provider.config {
        PlatformProviderConfig::Terraform(c) => c.drift_detection_enabled.unwrap_or(true),
        _ => false,
    }
}

#[async_trait]
impl StateChecker for Checker {
    async fn check(&self, app: &Application, head: &HeadSource<'_>) -> Result<Drift, PipedError> {
        // init writes into the application directory
        let source = head.load(true).await?;
        let spec = source.config.terraform_spec().ok_or_else(|| {
            PipedError::Config("missing TerraformApplicationSpec in application configuration".to_string())
        })?;
        let provider_vars = match &self.provider.config {
            PlatformProviderConfig::Terraform(c) => c.vars.clone(),
            _ => Vec::new(),
        };
        let (exec_path, _) = self
            .state
            .clients
            .tool_registry()
            .terraform(&spec.input.terraform_version)
            .await?;

        let lw = TracingLogWriter::new(format!("drift-detector/{}", app.id));
        let options = Options::from_input(&spec.input, &provider_vars);
        let cmd = Terraform::new(exec_path, &source.app_dir, options);
        cmd.prepare(&spec.input.workspace, &lw).await?;
        let plan = cmd.plan(&lw).await?;
        Ok(drift_of(&plan))
    }
}

fn drift_of(plan: &PlanResult) -> Drift {
    if plan.no_changes() {
        return Drift::None;
    }
    Drift::Detected {
        short_reason: format!(
            "There are {} manifests not synced ({} adds, {} deletes, {} changes)",
            plan.adds + plan.destroys + plan.changes,
            plan.adds,
            plan.destroys,
            plan.changes
        ),
        details: format!("--- Expected\n+++ Actual\n\n{}", plan.render()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled() {
        let on: PlatformProvider = serde_yaml::from_str("name: tf\ntype: TERRAFORM\n").unwrap();
        assert!(enabled(&on));
        let off: PlatformProvider =
            serde_yaml::from_str("name: tf\ntype: TERRAFORM\nconfig:\n  driftDetectionEnabled: false\n").unwrap();
        assert!(!enabled(&off));
    }

    #[test]
    fn test_drift_of_plan() {
        assert_eq!(drift_of(&PlanResult::default()), Drift::None);

        let plan = PlanResult {
            adds: 1,
            changes: 2,
            plan_output: "Terraform will perform the following actions:\n  + resource \"a\" \"b\" {\n    }\n".to_string(),
            ..Default::default()
        };
        let Drift::Detected { short_reason, details } = drift_of(&plan) else {
            panic!("expected a drift");
        };
        assert_eq!(short_reason, "There are 3 manifests not synced (1 adds, 0 deletes, 2 changes)");
        assert!(details.starts_with("--- Expected\n+++ Actual\n\n"));
    }
}
