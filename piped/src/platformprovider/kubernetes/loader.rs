use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use super::manifest::{parse_manifests, Manifest};
use crate::config::application::KubernetesDeploymentInput;
use crate::errors::PipedError;

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Load the manifests of an application directory.
///
/// The files listed in `input.manifests` are loaded in order. When none are listed,
/// every YAML/JSON file directly under `app_dir` except the application
/// configuration file is loaded, sorted by file name.
pub async fn load_manifests(
    app_dir: &Path,
    config_filename: &str,
    input: &KubernetesDeploymentInput,
) -> Result<Vec<Manifest>, PipedError> {
    let files = if input.manifests.is_empty() {
        list_manifest_files(app_dir, config_filename)?
    } else {
        input.manifests.clone()
    };

    let mut manifests = Vec::new();
    for file in &files {
        let path = app_dir.join(file);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipedError::Config(format!("failed to read manifest file {} ({})", file, e))
        })?;
        let mut loaded = parse_manifests(&data)
            .map_err(|e| PipedError::Config(format!("failed to parse manifest file {} ({})", file, e)))?;
        for m in &mut loaded {
            m.default_namespace(&input.namespace);
        }
        debug!("Loaded {} manifests from {}", loaded.len(), file);
        manifests.extend(loaded);
    }
    Ok(manifests)
}

fn list_manifest_files(app_dir: &Path, config_filename: &str) -> Result<Vec<String>, PipedError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(app_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PipedError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == config_filename {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        if MANIFEST_EXTENSIONS.contains(&ext.as_str()) {
            files.push(name);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: simple\n";
    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: simple\n";

    #[tokio::test]
    async fn test_load_all_files_except_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("service.yml"), SERVICE).unwrap();
        std::fs::write(dir.path().join("app.pipecd.yaml"), "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# simple").unwrap();

        let manifests = load_manifests(dir.path(), "app.pipecd.yaml", &KubernetesDeploymentInput::default())
            .await
            .unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].kind(), "Deployment");
        assert_eq!(manifests[1].kind(), "Service");
    }

    #[tokio::test]
    async fn test_load_listed_files_with_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("service.yaml"), SERVICE).unwrap();

        let input = KubernetesDeploymentInput {
            manifests: vec!["service.yaml".to_string()],
            namespace: "prod".to_string(),
            ..Default::default()
        };
        let manifests = load_manifests(dir.path(), "app.pipecd.yaml", &input).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].key.to_string(), "v1:Service:prod:simple");

        let input = KubernetesDeploymentInput {
            manifests: vec!["missing.yaml".to_string()],
            ..Default::default()
        };
        assert!(load_manifests(dir.path(), "app.pipecd.yaml", &input).await.is_err());
    }
}
