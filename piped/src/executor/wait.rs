use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::stage::StageOptions;
use crate::errors::PipedError;
use crate::executor::{status_on_stop, Executor, Input, Registry, StopSignal};
use crate::model::{StageName, StageStatus};
use crate::utils::now_unix;

const LOG_INTERVAL: Duration = Duration::from_secs(10);
const START_TIME_KEY: &str = "startTime";

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::Wait, Arc::new(|input| Box::new(WaitExecutor { input })))
}

pub struct WaitExecutor {
    input: Input,
}

#[async_trait]
impl Executor for WaitExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let original = self.input.stage.status;
        let Some(StageOptions::Wait(opts)) = self.input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
            return StageStatus::Failure;
        };

        // A resumed stage keeps waiting from the moment it first started
        let now = now_unix();
        let start = match self
            .input
            .stage_metadata()
            .put_if_absent(START_TIME_KEY, &now.to_string())
            .await
        {
            Ok(v) => v.parse::<i64>().unwrap_or(now),
            Err(e) => {
                lw.error(&format!("Failed to save the wait start time ({})", e));
                now
            }
        };
        let elapsed = Duration::from_secs(u64::try_from(now - start).unwrap_or(0));
        let remaining = opts.duration.saturating_sub(elapsed);
        if start != now {
            lw.info(&format!(
                "Resuming the wait, {}s left of {}s",
                remaining.as_secs(),
                opts.duration.as_secs()
            ));
        } else {
            lw.info(&format!("Waiting for {}s...", opts.duration.as_secs()));
        }

        let deadline = tokio::time::Instant::now() + remaining;
        let mut ticker = tokio::time::interval_at(deadline.min(tokio::time::Instant::now() + LOG_INTERVAL), LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    lw.success(&format!("Waited for {}s", opts.duration.as_secs()));
                    return StageStatus::Success;
                }
                _ = ticker.tick() => {
                    let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                    lw.info(&format!("{}s remaining to wait", left.as_secs()));
                }
                kind = sig.wait() => {
                    return status_on_stop(kind, original);
                }
            }
        }
    }
}
