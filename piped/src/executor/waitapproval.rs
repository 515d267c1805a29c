use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::stage::{StageOptions, WaitApprovalStageOptions};
use crate::errors::PipedError;
use crate::executor::{status_on_stop, Executor, Input, Registry, StopSignal};
use crate::model::{CommandStatus, StageName, StageStatus};

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const APPROVED_BY_KEY: &str = "ApprovedBy";

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(
        StageName::WaitApproval,
        Arc::new(|input| Box::new(WaitApprovalExecutor { input })),
    )
}

/// Shared metadata key holding the comma separated approvers of a stage
fn approvers_key(stage_id: &str) -> String {
    format!("{}-approvers", stage_id)
}

pub struct WaitApprovalExecutor {
    input: Input,
}

impl WaitApprovalExecutor {
    fn current_approvers(&self) -> Vec<String> {
        self.input
            .metadata
            .shared()
            .get(&approvers_key(&self.input.stage.id))
            .map(|v| {
                v.split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Consume pending approvals. Returns the approvers once enough of them approved.
    async fn check_approval(&self, opts: &WaitApprovalStageOptions) -> Option<Vec<String>> {
        let lw = self.input.lw();
        let mut approvers = self.current_approvers();
        let before = approvers.len();

        for cmd in self.input.commands.list_commands().await {
            let commander = cmd.commander.clone();
            let allowed = opts.approvers.is_empty() || opts.approvers.contains(&commander);
            let status = if !allowed {
                lw.error(&format!("{} is not allowed to approve this stage", commander));
                CommandStatus::Failed
            } else if approvers.contains(&commander) {
                lw.info(&format!("{} has already approved", commander));
                CommandStatus::Failed
            } else {
                lw.info(&format!("Got an approval from {}", commander));
                approvers.push(commander);
                CommandStatus::Succeeded
            };
            if let Err(e) = self.input.commands.report_handled(&cmd, status).await {
                warn!("Failed to report handled command {}: {}", cmd.id, e);
            }
        }

        if approvers.len() != before {
            let key = approvers_key(&self.input.stage.id);
            if let Err(e) = self.input.metadata.shared().put(&key, &approvers.join(",")).await {
                lw.error(&format!("Unable to save approver information to deployment ({})", e));
                return None;
            }
        }

        if approvers.len() < opts.min_approver_num {
            if approvers.len() != before {
                lw.info(&format!(
                    "{} more approvals are needed",
                    opts.min_approver_num - approvers.len()
                ));
            }
            return None;
        }
        Some(approvers)
    }
}

#[async_trait]
impl Executor for WaitApprovalExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let original = self.input.stage.status;
        let Some(StageOptions::WaitApproval(opts)) = self.input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
            return StageStatus::Failure;
        };

        let deadline = tokio::time::Instant::now() + opts.timeout;
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        lw.info("Waiting for an approval...");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(approvers) = self.check_approval(opts).await {
                        let by = approvers.join(", ");
                        if let Err(e) = self.input.stage_metadata().put(APPROVED_BY_KEY, &by).await {
                            lw.error(&format!("Unable to save approver information to deployment ({})", e));
                        }
                        lw.success(&format!("This stage has been approved by {}", by));
                        return StageStatus::Success;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    lw.error(&format!("Timed out {}s", opts.timeout.as_secs()));
                    return StageStatus::Failure;
                }
                kind = sig.wait() => {
                    return status_on_stop(kind, original);
                }
            }
        }
    }
}
