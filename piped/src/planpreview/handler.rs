use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use super::builder::Builder;
use crate::app::state::AppState;
use crate::errors::PipedError;
use crate::http::CommandHandledReport;
use crate::model::{BuildPlanPreview, Command, CommandKind, CommandStatus, PlanPreviewCommandResult};
use crate::utils::Retry;

const REPORT_RETRIES: u32 = 5;

/// Picks up plan-preview commands and reports their results
pub struct Handler {
    state: Arc<AppState>,
    builder: Builder,
    /// Commands already picked up and still listed as unhandled
    seen: Mutex<HashSet<String>>,
}

impl Handler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            builder: Builder::new(state.clone()),
            state,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// New plan-preview commands. The seen set is pruned to the listed commands.
    async fn new_commands(&self) -> Result<Vec<(Command, BuildPlanPreview)>, PipedError> {
        let commands = self.state.api.list_unhandled_commands().await?;
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| PipedError::Internal("plan-preview command set lock poisoned".to_string()))?;
        seen.retain(|id| commands.iter().any(|c| &c.id == id));

        let mut out = Vec::new();
        for command in commands {
            let CommandKind::BuildPlanPreview(preview) = &command.kind else {
                continue;
            };
            if seen.insert(command.id.clone()) {
                let preview = preview.clone();
                out.push((command, preview));
            }
        }
        Ok(out)
    }

    /// Handle every new plan-preview command, `worker_num` of them at a time
    pub async fn handle_once(&self) -> Result<(), PipedError> {
        let commands = self.new_commands().await?;
        if commands.is_empty() {
            return Ok(());
        }
        info!("Handling {} plan-preview commands", commands.len());
        let concurrency = self.state.piped.plan_preview.worker_num.max(1);
        stream::iter(commands)
            .for_each_concurrent(concurrency, |(command, preview)| async move {
                if let Err(e) = self.handle(&command, &preview).await {
                    error!("Failed to report the result of command {}: {}", command.id, e);
                }
            })
            .await;
        Ok(())
    }

    async fn handle(&self, command: &Command, preview: &BuildPlanPreview) -> Result<(), PipedError> {
        let mut result = PlanPreviewCommandResult {
            command_id: command.id.clone(),
            piped_id: self.state.piped.piped_id.clone(),
            ..Default::default()
        };
        let status = match self.builder.build(&command.id, preview).await {
            Ok(results) => {
                info!("Plan preview of command {} built for {} applications", command.id, results.len());
                result.results = results;
                CommandStatus::Succeeded
            }
            Err(e) => {
                warn!("Failed to build plan preview of command {}: {}", command.id, e);
                result.error = e.to_string();
                CommandStatus::Failed
            }
        };

        let report = &CommandHandledReport {
            command_id: command.id.clone(),
            status,
            metadata: HashMap::new(),
            output: Some(serde_json::to_value(&result)?),
        };
        let api = &self.state.api;
        Retry::exponential(REPORT_RETRIES)
            .run(|| async move { api.report_command_handled(report).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::DirGitClient;
    use crate::model::{Application, ApplicationGitPath, ApplicationKind, ApplicationRepo};
    use crate::planner::testing::write_app;

    fn command(id: &str, kind: CommandKind) -> Command {
        Command {
            id: id.to_string(),
            application_id: String::new(),
            deployment_id: String::new(),
            stage_id: String::new(),
            commander: "alice".to_string(),
            kind,
            created_at: 0,
        }
    }

    fn preview(head_branch: &str) -> CommandKind {
        CommandKind::BuildPlanPreview(BuildPlanPreview {
            repository_id: "repo-1".to_string(),
            head_branch: head_branch.to_string(),
            head_commit: "feedface".to_string(),
            base_branch: "main".to_string(),
        })
    }

    #[tokio::test]
    async fn test_handle_once_reports_results() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_app(
            &repo,
            &[("app.pipecd.yaml", "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n")],
        )
        .await;
        let git = DirGitClient {
            src: repo,
            conflicting_branch: Some("conflicting".to_string()),
            ..Default::default()
        };
        let (state, api) = crate::app::state::testing::state(dir.path(), git).await;
        api.add_application(Application {
            id: "web".to_string(),
            name: "web".to_string(),
            kind: ApplicationKind::Kubernetes,
            git_path: ApplicationGitPath {
                repo: ApplicationRepo {
                    id: "repo-1".to_string(),
                    ..Default::default()
                },
                path: "app".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        api.push_command(command("cmd-1", preview("feature"))).unwrap();
        api.push_command(command("cmd-2", preview("conflicting"))).unwrap();
        api.push_command(command("cmd-3", CommandKind::CancelDeployment)).unwrap();

        let handler = Handler::new(Arc::new(state));
        handler.handle_once().await.unwrap();
        // handled commands are not picked up twice
        handler.handle_once().await.unwrap();

        let mut handled = api.handled_commands();
        handled.sort_by(|a, b| a.command_id.cmp(&b.command_id));
        assert_eq!(handled.len(), 2);

        assert_eq!(handled[0].command_id, "cmd-1");
        assert_eq!(handled[0].status, CommandStatus::Succeeded);
        let output: PlanPreviewCommandResult =
            serde_json::from_value(handled[0].output.clone().unwrap()).unwrap();
        assert_eq!(output.piped_id, "piped-1");
        assert_eq!(output.results.len(), 1);
        assert!(output.error.is_empty());

        assert_eq!(handled[1].command_id, "cmd-2");
        assert_eq!(handled[1].status, CommandStatus::Failed);
        let output: PlanPreviewCommandResult =
            serde_json::from_value(handled[1].output.clone().unwrap()).unwrap();
        assert!(output.error.contains("detected conflicts"));
        assert!(output.results.is_empty());
    }
}
