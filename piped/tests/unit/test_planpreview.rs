//! Plan-preview helpers

use piped::model::{ApplicationKind, ApplicationPlanPreviewResult};
use piped::planpreview::{sort_results, worker_num, MAX_WORKER_NUM};

fn result(name: &str, kind: ApplicationKind, env: &str) -> ApplicationPlanPreviewResult {
    ApplicationPlanPreviewResult {
        application_id: format!("{}-{}", name, env),
        application_name: name.to_string(),
        application_kind: Some(kind),
        env: env.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_worker_num_scales_with_applications() {
    assert_eq!(worker_num(0), 1);
    assert_eq!(worker_num(2), 1);
    assert_eq!(worker_num(9), 3);
    assert_eq!(worker_num(10_000), MAX_WORKER_NUM);
}

#[test]
fn test_results_are_sorted_by_name_kind_and_env() {
    let mut results = vec![
        result("web", ApplicationKind::Kubernetes, "prod"),
        result("db", ApplicationKind::Terraform, "prod"),
        result("web", ApplicationKind::Kubernetes, "dev"),
        result("api", ApplicationKind::Kubernetes, ""),
    ];
    sort_results(&mut results);
    let ids: Vec<&str> = results.iter().map(|r| r.application_id.as_str()).collect();
    assert_eq!(ids, ["api-", "db-prod", "web-dev", "web-prod"]);
}
