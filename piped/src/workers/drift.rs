//! Drift detection worker, one per platform provider

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info};

use crate::driftdetector::Detector;

#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub async fn run<S, F>(
    options: &Options,
    detector: &Detector,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Drift detector for {} starting...", detector.provider_name());

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Drift detector for {} shutting down...", detector.provider_name());
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        if let Err(e) = detector.check_once().await {
            error!("Drift detection for {} failed: {}", detector.provider_name(), e);
        }
    }
}
