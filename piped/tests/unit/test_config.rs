//! Configuration unit tests

use std::time::Duration;

use piped::config::application::ApplicationConfig;
use piped::config::duration;
use piped::config::piped::{PipedConfig, PlatformProviderConfig};
use piped::errors::PipedError;
use piped::model::ApplicationKind;
use tokio_test::{assert_err, assert_ok};

const PIPED: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  pipedID: piped-1
  apiAddress: https://control-plane.example.com
  pipedKeyData: secret
  syncInterval: 30s
  repositories:
    - repoId: manifests
      remote: git@github.com:demo/manifests.git
      branch: main
  platformProviders:
    - name: dev-cluster
      type: KUBERNETES
      config:
        kubectlVersion: 1.28.0
    - name: infra
      type: TERRAFORM
      config:
        vars:
          - project=demo
        driftDetectionEnabled: false
  planPreview:
    workerNum: 5
  driftDetection:
    interval: 5m
"#;

#[test]
fn test_piped_config() {
    let spec = PipedConfig::parse(PIPED).unwrap().spec;
    assert_eq!(spec.piped_id, "piped-1");
    assert_eq!(spec.sync_interval, Duration::from_secs(30));
    assert_eq!(spec.plan_preview.worker_num, 5);
    assert_eq!(spec.plan_preview.command_check_interval, Duration::from_secs(5));
    assert!(spec.drift_detection.enabled);
    assert_eq!(spec.drift_detection.interval, Duration::from_secs(300));
    assert_eq!(spec.repository("manifests").unwrap().branch, "main");
    assert!(spec.repository("unknown").is_none());

    let infra = spec.find_platform_provider("infra", ApplicationKind::Terraform).unwrap();
    match &infra.config {
        PlatformProviderConfig::Terraform(c) => {
            assert_eq!(c.vars, ["project=demo"]);
            assert_eq!(c.drift_detection_enabled, Some(false));
        }
        other => panic!("unexpected config {:?}", other),
    }
}

#[test]
fn test_find_platform_provider_checks_the_kind() {
    let spec = PipedConfig::parse(PIPED).unwrap().spec;
    assert!(matches!(
        spec.find_platform_provider("dev-cluster", ApplicationKind::CloudRun),
        Err(PipedError::Config(_))
    ));
    assert!(matches!(
        spec.find_platform_provider("missing", ApplicationKind::Kubernetes),
        Err(PipedError::Config(_))
    ));
}

#[test]
fn test_wrong_kind_is_rejected() {
    let data = PIPED.replace("kind: Piped", "kind: KubernetesApp");
    assert_err!(PipedConfig::parse(&data));
}

#[test]
fn test_application_trigger_config() {
    let cfg = ApplicationConfig::parse(
        r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: web
  trigger:
    onCommit:
      paths:
        - shared/**
        - "!shared/docs/**"
"#,
    )
    .unwrap();
    assert_eq!(cfg.kind, ApplicationKind::Kubernetes);
    assert!(!cfg.generic.trigger.on_commit.disabled);
    assert_eq!(cfg.generic.trigger.on_commit.paths, ["shared/**", "!shared/docs/**"]);
    assert!(cfg.kubernetes_spec().is_some());
    assert!(cfg.terraform_spec().is_none());
}

#[test]
fn test_go_durations() {
    assert_eq!(assert_ok!(duration::parse("1h30m")), Duration::from_secs(5400));
    assert_eq!(assert_ok!(duration::parse("500ms")), Duration::from_millis(500));
    assert_err!(duration::parse("ten seconds"));
}
