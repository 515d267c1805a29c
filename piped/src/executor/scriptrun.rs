//! SCRIPT_RUN stage and the shell runner shared with CUSTOM_SYNC

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::stage::StageOptions;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, Executor, Input, Registry, StopSignal};
use crate::logs::{stream_command, StageLogWriter};
use crate::model::{StageName, StageStatus};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::ScriptRun, Arc::new(|input| Box::new(ScriptRunExecutor { input })))
}

/// Deployment facts exposed to user scripts
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextInfo<'a> {
    #[serde(rename = "deploymentID")]
    deployment_id: &'a str,
    #[serde(rename = "applicationID")]
    application_id: &'a str,
    application_name: &'a str,
    triggered_at: i64,
    triggered_commit_hash: &'a str,
    triggered_commander: &'a str,
    #[serde(rename = "repositoryURL")]
    repository_url: &'a str,
    summary: &'a str,
    is_rollback: bool,
}

/// `SR_*` variables describing the deployment, plus the raw JSON context
pub fn context_envs(input: &Input, is_rollback: bool) -> BTreeMap<String, String> {
    let d = &input.deployment;
    let info = ContextInfo {
        deployment_id: &d.id,
        application_id: &d.application_id,
        application_name: &d.application_name,
        triggered_at: d.trigger.timestamp,
        triggered_commit_hash: d.target_commit_hash(),
        triggered_commander: &d.trigger.commander,
        repository_url: &d.git_path.repo.remote,
        summary: &d.summary,
        is_rollback,
    };
    let mut envs = BTreeMap::new();
    envs.insert("SR_DEPLOYMENT_ID".to_string(), info.deployment_id.to_string());
    envs.insert("SR_APPLICATION_ID".to_string(), info.application_id.to_string());
    envs.insert("SR_APPLICATION_NAME".to_string(), info.application_name.to_string());
    envs.insert("SR_TRIGGERED_AT".to_string(), info.triggered_at.to_string());
    envs.insert("SR_TRIGGERED_COMMIT_HASH".to_string(), info.triggered_commit_hash.to_string());
    envs.insert("SR_TRIGGERED_COMMANDER".to_string(), info.triggered_commander.to_string());
    envs.insert("SR_REPOSITORY_URL".to_string(), info.repository_url.to_string());
    envs.insert("SR_SUMMARY".to_string(), info.summary.to_string());
    envs.insert("SR_IS_ROLLBACK".to_string(), info.is_rollback.to_string());
    if let Ok(raw) = serde_json::to_string(&info) {
        envs.insert("SR_CONTEXT_RAW".to_string(), raw);
    }
    envs
}

/// A user shell script to run under `/bin/sh -l -c`
pub struct ShellScript<'a> {
    pub run: &'a str,
    pub dir: &'a Path,
    pub envs: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Prepended to `PATH`
    pub extra_path: Option<&'a Path>,
}

impl ShellScript<'_> {
    /// Run the script to completion, streaming its output to `lw`.
    /// The child is killed on timeout or when `sig` fires.
    pub async fn run(&self, lw: &dyn StageLogWriter, sig: &StopSignal, original: StageStatus) -> StageStatus {
        for line in self.run.lines().filter(|l| !l.is_empty()) {
            lw.info(&format!("   {}", line));
        }

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-l").arg("-c").arg(self.run).current_dir(self.dir).envs(&self.envs);
        if let Some(extra) = self.extra_path {
            let path = std::env::var("PATH").unwrap_or_default();
            cmd.env("PATH", format!("{}:{}", extra.display(), path));
        }

        tokio::select! {
            result = stream_command(&mut cmd, lw) => match result {
                Ok((status, _)) if status.success() => StageStatus::Success,
                Ok((status, _)) => {
                    lw.error(&format!("The script exited with {}", status));
                    StageStatus::Failure
                }
                Err(e) => {
                    lw.error(&format!("Failed to execute the script ({})", e));
                    StageStatus::Failure
                }
            },
            _ = tokio::time::sleep(self.timeout) => {
                lw.error(&format!("Canceled because of timeout {}s", self.timeout.as_secs()));
                StageStatus::Failure
            }
            kind = sig.wait() => {
                lw.info("Script execution was interrupted");
                status_on_stop(kind, original)
            }
        }
    }
}

pub struct ScriptRunExecutor {
    input: Input,
}

#[async_trait]
impl Executor for ScriptRunExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let Some(StageOptions::ScriptRun(opts)) = self.input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
            return StageStatus::Failure;
        };
        if opts.run.trim().is_empty() {
            return StageStatus::Success;
        }
        let Some(ds) = self.input.target_source().await else {
            return StageStatus::Failure;
        };

        lw.info("Start executing the script run stage");
        let mut envs = context_envs(&self.input, false);
        envs.extend(opts.env.clone());
        let script = ShellScript {
            run: &opts.run,
            dir: &ds.app_dir,
            envs,
            timeout: opts.timeout,
            extra_path: None,
        };
        script.run(lw, sig, self.input.stage.status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::stage::PipelineStageConfig;
    use crate::executor::testing::{input, NoCommands};
    use crate::executor::{new_stop_signal, StopSignalKind};
    use crate::model::PipelineStage;

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

    async fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("app")).await.unwrap();
        tokio::fs::write(dir.path().join("app/app.pipecd.yaml"), APP).await.unwrap();
        dir
    }

    async fn run(script: &str) -> (StageStatus, Vec<String>) {
        let repo = repo().await;
        let work = tempfile::tempdir().unwrap();
        let yaml = format!("name: SCRIPT_RUN\nwith:\n  run: |\n    {}\n  env:\n    GREETING: hello\n", script);
        let config: PipelineStageConfig = serde_yaml::from_str(&yaml).unwrap();
        let stage = PipelineStage::new("stage-0", StageName::ScriptRun, 0, 0);
        let (input, _) = input(repo.path(), work.path(), stage, Some(config), APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();
        let status = ScriptRunExecutor { input: input.clone() }.execute(&sig).await;
        (status, input.log.blocks().into_iter().map(|b| b.log).collect())
    }

    #[tokio::test]
    async fn test_script_sees_env_and_app_dir() {
        let (status, logs) = run("echo \"$GREETING $SR_DEPLOYMENT_ID\" && ls").await;
        assert_eq!(status, StageStatus::Success);
        assert!(logs.iter().any(|l| l == "hello dep-1"));
        assert!(logs.iter().any(|l| l == "app.pipecd.yaml"));
    }

    #[tokio::test]
    async fn test_failing_script_fails_stage() {
        let (status, _) = run("exit 3").await;
        assert_eq!(status, StageStatus::Failure);
    }

    #[tokio::test]
    async fn test_timeout_kills_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = ShellScript {
            run: "sleep 30",
            dir: dir.path(),
            envs: BTreeMap::new(),
            timeout: Duration::from_millis(100),
            extra_path: None,
        };
        let lw = crate::logs::TracingLogWriter::new("test");
        let (_handler, sig) = new_stop_signal();
        assert_eq!(script.run(&lw, &sig, StageStatus::Running).await, StageStatus::Failure);
    }

    #[tokio::test]
    async fn test_terminate_keeps_original_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = ShellScript {
            run: "sleep 30",
            dir: dir.path(),
            envs: BTreeMap::new(),
            timeout: Duration::from_secs(60),
            extra_path: None,
        };
        let lw = crate::logs::TracingLogWriter::new("test");
        let (handler, sig) = new_stop_signal();
        handler.send(StopSignalKind::Terminate);
        assert_eq!(script.run(&lw, &sig, StageStatus::Running).await, StageStatus::Running);
    }
}
