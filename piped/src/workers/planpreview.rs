//! Plan-preview command worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info};

use crate::planpreview::Handler;

#[derive(Debug, Clone)]
pub struct Options {
    pub command_check_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            command_check_interval: Duration::from_secs(5),
        }
    }
}

pub async fn run<S, F>(
    options: &Options,
    handler: &Handler,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Plan-preview worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Plan-preview worker shutting down...");
                return;
            }
            _ = sleep_fn(options.command_check_interval) => {}
        }

        if let Err(e) = handler.handle_once().await {
            error!("Failed to handle plan-preview commands: {}", e);
        }
    }
}
