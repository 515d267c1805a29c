//! What merging a pull request would change, per application kind

use serde_json::Value;

use crate::app::state::AppState;
use crate::config::piped::PlatformProviderConfig;
use crate::deploysource::DeploySource;
use crate::diff::{self, Options, Renderer};
use crate::errors::PipedError;
use crate::logs::TracingLogWriter;
use crate::model::{Application, ApplicationKind, DEFAULT_APPLICATION_CONFIG_FILENAME};
use crate::platformprovider::cloudrun::ServiceManifest;
use crate::platformprovider::ecs::Definitions;
use crate::platformprovider::kubernetes::{diff_list, load_manifests, DiffRenderOptions, Manifest};
use crate::platformprovider::lambda::FunctionManifest;
use crate::platformprovider::terraform::{Options as TerraformOptions, Terraform};

pub const NO_CHANGES: &str = "No changes were detected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDiff {
    pub summary: String,
    pub details: String,
    pub no_change: bool,
}

impl PlanDiff {
    fn no_change() -> Self {
        Self {
            summary: NO_CHANGES.to_string(),
            details: String::new(),
            no_change: true,
        }
    }
}

fn config_filename(app: &Application) -> &str {
    match app.git_path.config_filename.as_str() {
        "" => DEFAULT_APPLICATION_CONFIG_FILENAME,
        name => name,
    }
}

async fn kubernetes_manifests(app: &Application, source: &DeploySource) -> Result<Vec<Manifest>, PipedError> {
    let spec = source.config.kubernetes_spec().ok_or_else(|| {
        PipedError::Config("missing KubernetesApplicationSpec in application configuration".to_string())
    })?;
    load_manifests(&source.app_dir, config_filename(app), &spec.input).await
}

/// Manifests of the running commit against the merged ones
pub async fn kubernetes(
    app: &Application,
    target: &DeploySource,
    running: Option<&DeploySource>,
) -> Result<PlanDiff, PipedError> {
    let news = kubernetes_manifests(app, target).await?;
    let olds = match running {
        Some(running) => kubernetes_manifests(app, running).await?,
        None => Vec::new(),
    };

    let result = diff_list(&olds, &news, &Options::default());
    if result.no_change() {
        return Ok(PlanDiff::no_change());
    }
    let options = DiffRenderOptions {
        mask_secret: true,
        mask_configmap: true,
        max_changed_manifests: 0,
        use_diff_command: true,
    };
    Ok(PlanDiff {
        summary: result.summary(),
        details: result.render(&options).await,
        no_change: false,
    })
}

/// `terraform plan` of the merged commit. `target` must be a writable copy.
pub async fn terraform(state: &AppState, app: &Application, target: &DeploySource) -> Result<PlanDiff, PipedError> {
    let spec = target.config.terraform_spec().ok_or_else(|| {
        PipedError::Config("missing TerraformApplicationSpec in application configuration".to_string())
    })?;
    let provider = state
        .piped
        .find_platform_provider(&app.platform_provider, ApplicationKind::Terraform)?;
    let vars = match &provider.config {
        PlatformProviderConfig::Terraform(c) => c.vars.clone(),
        _ => Vec::new(),
    };
    let (exec_path, _) = state.clients.tool_registry().terraform(&spec.input.terraform_version).await?;

    let lw = TracingLogWriter::new(format!("plan-preview/{}", app.id));
    let cmd = Terraform::new(exec_path, &target.app_dir, TerraformOptions::from_input(&spec.input, &vars));
    cmd.prepare(&spec.input.workspace, &lw).await?;
    let plan = cmd.plan(&lw).await?;
    if plan.no_changes() {
        return Ok(PlanDiff::no_change());
    }
    Ok(PlanDiff {
        summary: plan.summary(),
        details: plan.render(),
        no_change: false,
    })
}

/// Declared documents of the kinds whose whole state is a few manifests
async fn documents(source: &DeploySource) -> Result<Vec<(String, Value)>, PipedError> {
    let config = &source.config;
    if let Some(spec) = config.cloudrun_spec() {
        let sm = ServiceManifest::load(&source.app_dir, &spec.input.service_manifest_file).await?;
        return Ok(vec![("service manifest".to_string(), sm.body)]);
    }
    if let Some(spec) = config.lambda_spec() {
        let fm = FunctionManifest::load(&source.app_dir, &spec.input.function_manifest_file).await?;
        return Ok(vec![("function manifest".to_string(), serde_json::to_value(fm)?)]);
    }
    if let Some(spec) = config.ecs_spec() {
        let defs = Definitions::load(&source.app_dir, &spec.input).await?;
        return Ok(vec![
            ("task definition".to_string(), defs.task.body),
            ("service definition".to_string(), defs.service.body),
        ]);
    }
    Err(PipedError::Config(format!(
        "{} application has no manifest to compare",
        config.kind
    )))
}

/// Field level diff of the declared manifests. Everything is an addition
/// for an application that was never deployed.
pub async fn manifests(target: &DeploySource, running: Option<&DeploySource>) -> Result<PlanDiff, PipedError> {
    let news = documents(target).await?;
    let olds = match running {
        Some(running) => documents(running).await?,
        None => Vec::new(),
    };

    let renderer = Renderer::new().with_left_padding(1);
    let empty = Value::Object(Default::default());
    let mut changed = Vec::new();
    let mut details = String::new();
    for (name, new) in &news {
        let old = olds
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .unwrap_or(&empty);
        let result = diff::diff(old, new, &Options::default());
        if result.no_change() {
            continue;
        }
        details.push_str(&format!("# {}\n\n{}\n", name, renderer.render(result.nodes())));
        changed.push(format!("{} changed fields in the {}", result.num(), name));
    }

    if changed.is_empty() {
        return Ok(PlanDiff::no_change());
    }
    Ok(PlanDiff {
        summary: changed.join(", "),
        details,
        no_change: false,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::config::application::ApplicationConfig;
    use crate::planner::testing::write_app;

    async fn source(repo: &Path, files: &[(&str, &str)]) -> DeploySource {
        write_app(repo, files).await;
        let config = ApplicationConfig::load(&repo.join("app").join("app.pipecd.yaml")).await.unwrap();
        DeploySource {
            repo_dir: repo.to_path_buf(),
            app_dir: repo.join("app"),
            revision_name: "target".to_string(),
            revision: "0123456789abcdef".to_string(),
            config: Arc::new(config),
        }
    }

    fn application() -> Application {
        Application {
            id: "app-1".to_string(),
            kind: ApplicationKind::Kubernetes,
            ..Default::default()
        }
    }

    const K8S_APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";
    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\nspec:\n  ports:\n    - port: 80\n";
    const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\ndata:\n  key: value\n";

    #[tokio::test]
    async fn test_kubernetes_first_deployment_adds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let target = source(dir.path(), &[("app.pipecd.yaml", K8S_APP), ("service.yaml", SERVICE)]).await;

        let diff = kubernetes(&application(), &target, None).await.unwrap();
        assert!(!diff.no_change);
        assert_eq!(diff.summary, "1 added manifests, 0 changed manifests, 0 deleted manifests");
    }

    #[tokio::test]
    async fn test_kubernetes_against_running() {
        let dir = tempfile::tempdir().unwrap();
        let running = source(&dir.path().join("running"), &[("app.pipecd.yaml", K8S_APP), ("service.yaml", SERVICE)]).await;
        let same = source(&dir.path().join("same"), &[("app.pipecd.yaml", K8S_APP), ("service.yaml", SERVICE)]).await;
        let diff = kubernetes(&application(), &same, Some(&running)).await.unwrap();
        assert_eq!(diff, PlanDiff::no_change());

        let changed = source(
            &dir.path().join("changed"),
            &[
                ("app.pipecd.yaml", K8S_APP),
                ("service.yaml", &SERVICE.replace("80", "8080")),
                ("configmap.yaml", CONFIGMAP),
            ],
        )
        .await;
        let diff = kubernetes(&application(), &changed, Some(&running)).await.unwrap();
        assert_eq!(diff.summary, "1 added manifests, 1 changed manifests, 0 deleted manifests");
    }

    const RUN_APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: CloudRunApp\nspec: {}\n";
    const RUN_SERVICE: &str = r#"
apiVersion: serving.knative.dev/v1
kind: Service
metadata:
  name: helloworld
spec:
  template:
    spec:
      containers:
        - image: gcr.io/demo/helloworld:v0.1.0
"#;

    #[tokio::test]
    async fn test_manifests_diff() {
        let dir = tempfile::tempdir().unwrap();
        let running = source(&dir.path().join("running"), &[("app.pipecd.yaml", RUN_APP), ("service.yaml", RUN_SERVICE)]).await;
        let target = source(
            &dir.path().join("target"),
            &[("app.pipecd.yaml", RUN_APP), ("service.yaml", &RUN_SERVICE.replace("v0.1.0", "v0.2.0"))],
        )
        .await;

        let diff = manifests(&target, Some(&running)).await.unwrap();
        assert_eq!(diff.summary, "1 changed fields in the service manifest");
        assert!(diff.details.starts_with("# service manifest\n\n"));
        assert!(diff.details.contains("v0.2.0"));

        let same = manifests(&running, Some(&running)).await.unwrap();
        assert!(same.no_change);
        assert_eq!(same.summary, NO_CHANGES);
    }
}
