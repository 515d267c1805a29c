//! Terraform adapter
//!
//! Wraps the `terraform` binary. A deployment runs
//! `version -> init -> workspace select -> plan -> apply` in the application
//! directory; the live state of an application is its plan.

mod module;
mod plan;

pub use module::{find_artifact_versions, load_terraform_files, parse_modules, Module, TerraformFile};
pub use plan::{parse_plan_result, strip_ansi_codes, PlanResult};

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::application::{TerraformCommandEnvs, TerraformCommandFlags, TerraformDeploymentInput};
use crate::errors::PipedError;
use crate::logs::{stream_command, StageLogWriter};

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub no_color: bool,
    pub vars: Vec<String>,
    pub var_files: Vec<String>,
    pub flags: TerraformCommandFlags,
    /// `KEY=VALUE` entries added to the process environment
    pub envs: TerraformCommandEnvs,
}

impl Options {
    /// Options of an application, with the platform provider vars first
    pub fn from_input(input: &TerraformDeploymentInput, provider_vars: &[String]) -> Self {
        let mut vars = provider_vars.to_vec();
        vars.extend(input.vars.iter().cloned());
        Self {
            no_color: true,
            vars,
            var_files: input.var_files.clone(),
            flags: input.command_flags.clone(),
            envs: input.command_envs.clone(),
        }
    }
}

pub struct Terraform {
    exec_path: PathBuf,
    dir: PathBuf,
    options: Options,
}

impl Terraform {
    pub fn new(exec_path: impl Into<PathBuf>, dir: impl Into<PathBuf>, options: Options) -> Self {
        Self {
            exec_path: exec_path.into(),
            dir: dir.into(),
            options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self, args: &[String], stage_envs: &[String]) -> Command {
        let mut cmd = Command::new(&self.exec_path);
        cmd.args(args).current_dir(&self.dir);
        for kv in self.options.envs.shared.iter().chain(stage_envs) {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
        cmd
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.options.no_color {
            args.push("-no-color".to_string());
        }
        args.extend(self.options.vars.iter().map(|v| format!("-var={}", v)));
        args.extend(self.options.var_files.iter().map(|f| format!("-var-file={}", f)));
        args.extend(self.options.flags.shared.iter().cloned());
        args
    }

    pub fn init_args(&self) -> Vec<String> {
        let mut args = vec!["init".to_string()];
        args.extend(self.common_args());
        args.extend(self.options.flags.init.iter().cloned());
        args
    }

    pub fn plan_args(&self) -> Vec<String> {
        let mut args = vec![
            "plan".to_string(),
            "-lock=false".to_string(),
            "-detailed-exitcode".to_string(),
        ];
        args.extend(self.common_args());
        args.extend(self.options.flags.plan.iter().cloned());
        args
    }

    pub fn apply_args(&self) -> Vec<String> {
        let mut args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        args.extend(self.common_args());
        args.extend(self.options.flags.apply.iter().cloned());
        args
    }

    pub async fn version(&self) -> Result<String, PipedError> {
        let output = self.command(&["version".to_string()], &[]).output().await?;
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(PipedError::Internal(format!(
                "terraform version failed: {}{}",
                text,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(text)
    }

    pub async fn init(&self, lw: &dyn StageLogWriter) -> Result<(), PipedError> {
        let args = self.init_args();
        lw.info(&format!("terraform {}", args.join(" ")));
        let (status, _) = stream_command(&mut self.command(&args, &self.options.envs.init), lw).await?;
        if !status.success() {
            return Err(PipedError::UserScript(format!("terraform init failed ({})", status)));
        }
        Ok(())
    }

    pub async fn select_workspace(&self, workspace: &str) -> Result<(), PipedError> {
        let args = ["workspace".to_string(), "select".to_string(), workspace.to_string()];
        let output = self.command(&args, &[]).output().await?;
        if !output.status.success() {
            return Err(PipedError::UserScript(format!(
                "failed to select workspace: {}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// `terraform plan -detailed-exitcode`: exit 0 means no changes, exit 2
    /// means changes which are parsed from the output.
    pub async fn plan(&self, lw: &dyn StageLogWriter) -> Result<PlanResult, PipedError> {
        let args = self.plan_args();
        lw.info(&format!("terraform {}", args.join(" ")));
        let (status, output) = stream_command(&mut self.command(&args, &self.options.envs.plan), lw).await?;
        match status.code() {
            Some(0) => Ok(PlanResult::default()),
            Some(2) => parse_plan_result(&output, !self.options.no_color),
            _ => Err(PipedError::UserScript(format!("terraform plan failed ({})", status))),
        }
    }

    pub async fn apply(&self, lw: &dyn StageLogWriter) -> Result<(), PipedError> {
        let args = self.apply_args();
        lw.info(&format!("terraform {}", args.join(" ")));
        let (status, _) = stream_command(&mut self.command(&args, &self.options.envs.apply), lw).await?;
        if !status.success() {
            return Err(PipedError::UserScript(format!("terraform apply failed ({})", status)));
        }
        Ok(())
    }

    /// `version`, `init` then `workspace select` when a workspace is set
    pub async fn prepare(&self, workspace: &str, lw: &dyn StageLogWriter) -> Result<(), PipedError> {
        let version = self.version().await?;
        lw.info(&format!("Using terraform version {}", version.lines().next().unwrap_or_default()));
        self.init(lw).await?;
        if !workspace.is_empty() {
            lw.info(&format!("terraform workspace select {}", workspace));
            self.select_workspace(workspace).await?;
        }
        Ok(())
    }
}
