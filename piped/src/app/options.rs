//! Process options derived from the piped configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::config::piped::PipedSpec;
use crate::workers::{controller, drift, planpreview};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Path of the piped configuration file
    pub config_file: PathBuf,

    pub lifecycle: LifecycleOptions,

    pub enable_drift_detection: bool,

    pub enable_plan_preview: bool,

    pub controller: controller::Options,

    pub drift_detection: drift::Options,

    pub plan_preview: planpreview::Options,
}

impl AppOptions {
    /// Options matching the intervals and switches of a loaded configuration
    pub fn from_spec(config_file: PathBuf, spec: &PipedSpec) -> Self {
        Self {
            config_file,
            lifecycle: LifecycleOptions::default(),
            enable_drift_detection: spec.drift_detection.enabled,
            enable_plan_preview: true,
            controller: controller::Options {
                sync_interval: spec.sync_interval,
            },
            drift_detection: drift::Options {
                interval: spec.drift_detection.interval,
            },
            plan_preview: planpreview::Options {
                command_check_interval: spec.plan_preview.command_check_interval,
            },
        }
    }
}

/// Lifecycle options of the process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::piped::PipedConfig;

    #[test]
    fn test_from_spec() {
        let spec = PipedConfig::parse(
            r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  pipedID: piped-1
  apiAddress: http://localhost:8080
  syncInterval: 30s
  driftDetection:
    enabled: false
    interval: 2m
  planPreview:
    commandCheckInterval: 10s
"#,
        )
        .unwrap()
        .spec;
        let options = AppOptions::from_spec(PathBuf::from("piped.yaml"), &spec);
        assert_eq!(options.controller.sync_interval, Duration::from_secs(30));
        assert!(!options.enable_drift_detection);
        assert_eq!(options.drift_detection.interval, Duration::from_secs(120));
        assert_eq!(options.plan_preview.command_check_interval, Duration::from_secs(10));
    }
}
