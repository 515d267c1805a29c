//! Deployment controller worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::controller::Controller;

#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between two reconciliations of the not completed deployments
    pub sync_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// Run the controller worker. On shutdown the running schedulers are interrupted.
pub async fn run<S, F>(
    options: &Options,
    controller: &Controller,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Controller worker starting...");

    loop {
        debug!("Syncing deployments...");
        if let Err(e) = controller.sync_once().await {
            error!("Failed to sync deployments: {}", e);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Controller worker shutting down...");
                controller.shutdown().await;
                return;
            }
            _ = sleep_fn(options.sync_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::git::testing::DirGitClient;

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = crate::app::state::testing::state(dir.path(), DirGitClient::default()).await;
        let controller = Controller::new(Arc::new(state));

        let options = Options {
            sync_interval: Duration::from_millis(10),
        };
        let shutdown = Box::pin(tokio::time::sleep(Duration::from_millis(50)));
        tokio::time::timeout(
            Duration::from_secs(5),
            run(&options, &controller, tokio::time::sleep, shutdown),
        )
        .await
        .unwrap();
        assert!(controller.running_deployments().is_empty());
    }
}
