//! Registry of the external binaries piped shells out to
//!
//! Versioned binaries live in `toolsDir` as `{tool}-{version}`. Missing ones are
//! installed on first use with a download script, concurrent requests for the
//! same tool and version share a single install.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::config::stage::ExternalTool;
use crate::errors::PipedError;

pub const KUBECTL: &str = "kubectl";
pub const TERRAFORM: &str = "terraform";

const DEFAULT_KUBECTL_VERSION: &str = "1.18.2";
const DEFAULT_TERRAFORM_VERSION: &str = "0.13.0";

type InstallCell = Arc<OnceCell<Result<(), String>>>;

pub struct ToolRegistry {
    bin_dir: PathBuf,
    installed: RwLock<HashSet<String>>,
    in_flight: Mutex<HashMap<String, InstallCell>>,
}

impl ToolRegistry {
    /// Create the registry, registering the binaries already present in `bin_dir`
    pub async fn new(bin_dir: &Path) -> Result<Self, PipedError> {
        tokio::fs::create_dir_all(bin_dir).await?;

        let mut installed = HashSet::new();
        for entry in WalkDir::new(bin_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| PipedError::Internal(e.to_string()))?;
            if entry.file_type().is_file() {
                installed.insert(entry.file_name().to_string_lossy().to_string());
            }
        }
        info!("Successfully loaded the pre-installed tools: {:?}", installed);

        Ok(Self {
            bin_dir: bin_dir.to_path_buf(),
            installed: RwLock::new(installed),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Path of kubectl at `version` (empty for the default one) and whether it was just installed
    pub async fn kubectl(&self, version: &str) -> Result<(PathBuf, bool), PipedError> {
        self.tool(KUBECTL, version, |working_dir, bin_dir, version, as_default| {
            kubectl_install_script(working_dir, bin_dir, version, as_default)
        })
        .await
    }

    /// Path of terraform at `version` (empty for the default one) and whether it was just installed
    pub async fn terraform(&self, version: &str) -> Result<(PathBuf, bool), PipedError> {
        self.tool(TERRAFORM, version, |working_dir, bin_dir, version, as_default| {
            terraform_install_script(working_dir, bin_dir, version, as_default)
        })
        .await
    }

    /// Make an `externalTools` entry of a custom sync stage available through asdf
    pub async fn external_tool(&self, app_dir: &Path, tool: &ExternalTool) -> Result<bool, PipedError> {
        which::which("asdf")
            .map_err(|e| PipedError::Config(format!("failed to find asdf ({})", e)))?;

        let listed = run_script(&format!("asdf list {} {}", tool.command, tool.version)).await;
        let just_installed = if listed.is_err() {
            let key = format!("{}{}", tool.command, tool.version);
            let script = format!(
                "asdf plugin add {cmd} || true\nasdf install {cmd} {ver}",
                cmd = tool.command,
                ver = tool.version
            );
            self.install_once(&key, script).await?;
            true
        } else {
            false
        };

        let script = format!(
            "cd {}\nasdf local {} {}",
            app_dir.display(),
            tool.command,
            tool.version
        );
        if let Err(e) = run_script(&script).await {
            error!("Failed to set {} version {}: {}", tool.command, tool.version, e);
        }
        Ok(just_installed)
    }

    async fn tool<F>(&self, prefix: &str, version: &str, script: F) -> Result<(PathBuf, bool), PipedError>
    where
        F: FnOnce(&Path, &Path, &str, bool) -> String,
    {
        let name = if version.is_empty() {
            prefix.to_string()
        } else {
            format!("{}-{}", prefix, version)
        };
        let path = self.bin_dir.join(&name);
        if self.is_installed(&name) {
            return Ok((path, false));
        }

        // The default version may already be provided by the host
        if version.is_empty() {
            if let Ok(found) = which::which(prefix) {
                return Ok((found, false));
            }
        }

        let working_dir = tempfile::Builder::new()
            .prefix(&format!("{}-install", prefix))
            .tempdir()?;
        let as_default = version.is_empty();
        let version = if as_default {
            default_version(prefix)
        } else {
            version
        };
        let script = script(working_dir.path(), &self.bin_dir, version, as_default);
        self.install_once(&name, script).await?;

        self.mark_installed(&name);
        info!("Just installed {} {}", prefix, version);
        Ok((path, true))
    }

    fn is_installed(&self, name: &str) -> bool {
        self.installed
            .read()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    fn mark_installed(&self, name: &str) {
        if let Ok(mut set) = self.installed.write() {
            set.insert(name.to_string());
        }
    }

    /// Run `script` once per `key` among concurrent callers
    async fn install_once(&self, key: &str, script: String) -> Result<(), PipedError> {
        let cell = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| PipedError::Internal("tool registry lock poisoned".to_string()))?;
            in_flight.entry(key.to_string()).or_default().clone()
        };

        let result = cell
            .get_or_init(|| async move { run_script(&script).await.map(|_| ()) })
            .await
            .clone();

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(key);
        }
        result.map_err(|e| PipedError::Internal(format!("failed to install {} ({})", key, e)))
    }
}

fn default_version(prefix: &str) -> &'static str {
    match prefix {
        TERRAFORM => DEFAULT_TERRAFORM_VERSION,
        _ => DEFAULT_KUBECTL_VERSION,
    }
}

async fn run_script(script: &str) -> Result<String, String> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    let mut out = String::from_utf8_lossy(&output.stdout).to_string();
    out.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(out);
    }
    Ok(out)
}

fn kubectl_install_script(working_dir: &Path, bin_dir: &Path, version: &str, as_default: bool) -> String {
    let mut script = format!(
        "cd {wd}\n\
         curl -LO https://storage.googleapis.com/kubernetes-release/release/v{v}/bin/linux/amd64/kubectl\n\
         mv kubectl {bin}/kubectl-{v}\n\
         chmod +x {bin}/kubectl-{v}\n",
        wd = working_dir.display(),
        bin = bin_dir.display(),
        v = version
    );
    if as_default {
        script.push_str(&format!(
            "cp -f {bin}/kubectl-{v} {bin}/kubectl\n",
            bin = bin_dir.display(),
            v = version
        ));
    }
    script
}

fn terraform_install_script(working_dir: &Path, bin_dir: &Path, version: &str, as_default: bool) -> String {
    let mut script = format!(
        "cd {wd}\n\
         curl https://releases.hashicorp.com/terraform/{v}/terraform_{v}_linux_amd64.zip -o terraform_{v}_linux_amd64.zip\n\
         unzip terraform_{v}_linux_amd64.zip\n\
         mv terraform {bin}/terraform-{v}\n\
         chmod +x {bin}/terraform-{v}\n",
        wd = working_dir.display(),
        bin = bin_dir.display(),
        v = version
    );
    if as_default {
        script.push_str(&format!(
            "cp -f {bin}/terraform-{v} {bin}/terraform\n",
            bin = bin_dir.display(),
            v = version
        ));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preinstalled_tool_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubectl-1.20.0"), "#!/bin/sh\n").unwrap();

        let registry = ToolRegistry::new(dir.path()).await.unwrap();
        let (path, installed) = registry.kubectl("1.20.0").await.unwrap();
        assert_eq!(path, dir.path().join("kubectl-1.20.0"));
        assert!(!installed);
    }

    #[tokio::test]
    async fn test_install_once_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(dir.path()).await.unwrap());
        let counter = dir.path().join("count");
        let script = format!("sleep 0.2\necho x >> {}", counter.display());

        let (a, b) = tokio::join!(
            registry.install_once("fake-1.0", script.clone()),
            registry.install_once("fake-1.0", script.clone()),
        );
        a.unwrap();
        b.unwrap();

        let count = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(count.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path()).await.unwrap();
        assert!(registry.install_once("bad-1.0", "exit 3".to_string()).await.is_err());
        assert!(registry.install_once("bad-1.0", "true".to_string()).await.is_ok());
    }

    #[test]
    fn test_install_scripts() {
        let script = terraform_install_script(Path::new("/tmp/w"), Path::new("/tools"), "1.5.0", true);
        assert!(script.contains("terraform_1.5.0_linux_amd64.zip"));
        assert!(script.contains("mv terraform /tools/terraform-1.5.0"));
        assert!(script.ends_with("cp -f /tools/terraform-1.5.0 /tools/terraform\n"));

        let script = kubectl_install_script(Path::new("/tmp/w"), Path::new("/tools"), "1.29.0", false);
        assert!(script.contains("release/v1.29.0/bin/linux/amd64/kubectl"));
        assert!(!script.contains("/tools/kubectl\n"));
    }
}
