use std::path::{Component, Path, PathBuf};

use crate::errors::PipedError;
use crate::model::{ArtifactKind, ArtifactVersion, ApplicationGitPath};
use crate::regexpool::default_pool;

const MODULE_HEADER: &str = r#"^module\s+"([^"]+)"\s*\{"#;
const MODULE_ATTRIBUTE: &str = r#"^(source|version)\s*=\s*"([^"]*)""#;
const REGISTRY_URL: &str = "https://registry.terraform.io/modules";

/// A `module` block of a Terraform file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub source: String,
    pub version: String,
    pub is_local: bool,
}

/// Modules declared in one `.tf` file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerraformFile {
    pub path: PathBuf,
    pub modules: Vec<Module>,
}

/// Read every top-level `.tf` file of `dir`, sorted by name.
pub async fn load_terraform_files(dir: &Path) -> Result<Vec<TerraformFile>, PipedError> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && path.extension().is_some_and(|e| e == "tf") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read_to_string(&path).await?;
        files.push(TerraformFile {
            modules: parse_modules(&data)?,
            path,
        });
    }
    if files.is_empty() {
        return Err(PipedError::Config(format!(
            "couldn't find terraform module in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// Extract the `module` blocks with their top-level `source` and `version`.
///
/// This is a line scanner, not an HCL parser. It expects the formatting
/// `terraform fmt` produces: one block header and one attribute per line.
pub fn parse_modules(data: &str) -> Result<Vec<Module>, PipedError> {
    let header = default_pool().get(MODULE_HEADER)?;
    let attribute = default_pool().get(MODULE_ATTRIBUTE)?;

    let mut modules = Vec::new();
    let mut current: Option<Module> = None;
    let mut depth = 0i32;

    for line in data.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        match current.as_mut() {
            None => {
                if let Some(caps) = header.captures(line) {
                    current = Some(Module {
                        name: caps[1].to_string(),
                        ..Default::default()
                    });
                    depth = brace_delta(line);
                    if depth <= 0 {
                        modules.extend(current.take());
                    }
                }
            }
            Some(module) => {
                if depth == 1 {
                    if let Some(caps) = attribute.captures(line) {
                        match &caps[1] {
                            "source" => {
                                module.source = caps[2].to_string();
                                module.is_local = is_local_source(&module.source);
                            }
                            _ => module.version = caps[2].to_string(),
                        }
                    }
                }
                depth += brace_delta(line);
                if depth <= 0 {
                    modules.extend(current.take());
                }
            }
        }
    }
    Ok(modules)
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string = false;
    let mut prev = '\0';
    for c in line.chars() {
        match c {
            '"' if prev != '\\' => in_string = !in_string,
            '{' if !in_string => delta += 1,
            '}' if !in_string => delta -= 1,
            _ => {}
        }
        prev = c;
    }
    delta
}

fn is_local_source(source: &str) -> bool {
    source.starts_with("./") || source.starts_with("../")
}

/// Artifact versions of the modules used by the application.
///
/// Local modules link to their directory in the application repository,
/// registry modules to the public registry, anything else to its source.
pub fn find_artifact_versions(
    files: &[TerraformFile],
    git_path: &ApplicationGitPath,
    repo_dir: &Path,
    app_dir: &Path,
) -> Vec<ArtifactVersion> {
    let mut versions = Vec::new();
    for module in files.iter().flat_map(|f| f.modules.iter()) {
        let url = if module.is_local {
            let relative = app_dir.strip_prefix(repo_dir).unwrap_or(Path::new(""));
            let dir = clean_path(&relative.join(&module.source));
            format!(
                "{}/tree/{}/{}",
                git_path.repo.remote.trim_end_matches(".git").trim_end_matches('/'),
                git_path.repo.branch,
                dir
            )
        } else if module.source.contains("://") || module.source.contains("::") {
            module.source.clone()
        } else {
            format!("{}/{}/{}", REGISTRY_URL, module.source, module.version)
        };
        versions.push(ArtifactVersion {
            kind: ArtifactKind::TerraformModule,
            version: module.version.clone(),
            name: module.name.clone(),
            url,
        });
    }
    versions
}

fn clean_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationRepo;

    const MAIN_TF: &str = r#"
terraform {
  required_version = ">= 1.0"
}

module "helloworld_01" {
  source  = "./helloworld"
  version = "v1.0.0"

  tags = {
    env = "dev"
  }
}

# module "disabled" {
module "helloworld_02" {
  source = "./helloworld"
  version = "v0.9.0"
}

module "vpc" {
  source  = "terraform-aws-modules/vpc/aws"
  version = "5.1.0"
}
"#;

    #[test]
    fn test_parse_modules() {
        let modules = parse_modules(MAIN_TF).unwrap();
        assert_eq!(modules.len(), 3);
        assert_eq!(
            modules[0],
            Module {
                name: "helloworld_01".to_string(),
                source: "./helloworld".to_string(),
                version: "v1.0.0".to_string(),
                is_local: true,
            }
        );
        assert_eq!(modules[1].version, "v0.9.0");
        assert!(!modules[2].is_local);
    }

    #[tokio::test]
    async fn test_find_artifact_versions() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("apps/infra");
        tokio::fs::create_dir_all(&app_dir).await.unwrap();
        tokio::fs::write(app_dir.join("main.tf"), MAIN_TF).await.unwrap();
        tokio::fs::write(app_dir.join("README.md"), "module \"x\" {}").await.unwrap();

        let files = load_terraform_files(&app_dir).await.unwrap();
        assert_eq!(files.len(), 1);

        let git_path = ApplicationGitPath {
            repo: ApplicationRepo {
                id: "repo".to_string(),
                remote: "https://github.com/example/infra.git".to_string(),
                branch: "main".to_string(),
            },
            ..Default::default()
        };
        let versions = find_artifact_versions(&files, &git_path, dir.path(), &app_dir);
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].kind, ArtifactKind::TerraformModule);
        assert_eq!(versions[0].url, "https://github.com/example/infra/tree/main/apps/infra/helloworld");
        assert_eq!(
            versions[2].url,
            "https://registry.terraform.io/modules/terraform-aws-modules/vpc/aws/5.1.0"
        );
    }

    #[tokio::test]
    async fn test_no_terraform_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_terraform_files(dir.path()).await.is_err());
    }
}
