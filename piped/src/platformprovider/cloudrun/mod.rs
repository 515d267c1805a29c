//! Cloud Run adapter
//!
//! Services are applied as Knative `Service` objects. Every revision is named
//! from the image tag and the commit so a second deployment of the same commit
//! reuses the revision instead of creating a new one.

mod client;
mod manifest;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub use client::{Client, RestClient};
pub use manifest::{RevisionTraffic, ServiceManifest};

use crate::diff::{self, DiffResult, Options};
use crate::errors::PipedError;
use crate::model::ArtifactVersion;
use crate::platformprovider::{builtin_labels, parse_container_image, LABEL_REVISION_NAME};

/// Slashes are not allowed in Cloud Run label keys
pub const LABEL_PREFIX: &str = "pipecd-dev-";

pub const REVISION_READY_INTERVAL: Duration = Duration::from_secs(10);
pub const REVISION_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Readiness as reported by a revision's `status.conditions`
#[derive(Debug, Clone, Default)]
pub struct StatusConditions {
    conditions: Vec<Condition>,
}

/// Condition types inspected when waiting for a revision
pub const CONDITION_TYPES: [&str; 6] = [
    "Active",
    "Ready",
    "ConfigurationsReady",
    "RoutesReady",
    "ContainerHealthy",
    "ResourcesAvailable",
];

pub enum Readiness {
    Ready,
    /// Still converging
    Pending(String),
    /// A condition failed, waiting longer will not help
    Failed(String),
}

impl StatusConditions {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    fn status_of(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn readiness(&self) -> Readiness {
        for c in &self.conditions {
            if CONDITION_TYPES.contains(&c.kind.as_str()) && c.status == "False" {
                return Readiness::Failed(format!("{} is False: {} {}", c.kind, c.reason, c.message).trim_end().to_string());
            }
        }
        let is_true = |kind: &str| self.status_of(kind).map(|c| c.status == "True").unwrap_or(false);
        if is_true("Ready") && is_true("Active") {
            return Readiness::Ready;
        }
        let waiting: Vec<&str> = CONDITION_TYPES
            .iter()
            .filter(|k| !is_true(k))
            .copied()
            .collect();
        Readiness::Pending(format!("waiting for {}", waiting.join(", ")))
    }
}

/// A revision returned by the API
#[derive(Debug, Clone)]
pub struct Revision {
    pub name: String,
    pub body: Value,
}

impl Revision {
    pub fn from_value(body: Value) -> Self {
        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { name, body }
    }

    pub fn status_conditions(&self) -> StatusConditions {
        let conditions = self
            .body
            .pointer("/status/conditions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        StatusConditions::new(conditions)
    }
}

/// Add the builtin labels to the service and its revision template
pub fn add_builtin_labels(
    sm: &mut ServiceManifest,
    piped_id: &str,
    app_id: &str,
    commit: &str,
    revision: &str,
) -> Result<(), PipedError> {
    let labels = builtin_labels(LABEL_PREFIX, piped_id, app_id, commit);
    sm.add_labels(&labels)?;
    let mut revision_labels = labels;
    if !revision.is_empty() {
        revision_labels.insert(format!("{}{}", LABEL_PREFIX, LABEL_REVISION_NAME), revision.to_string());
    }
    sm.add_revision_labels(&revision_labels)
}

/// Update the service, creating it when it does not exist yet
pub async fn apply(client: &dyn Client, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
    match update(client, sm).await {
        Ok(service) => Ok(service),
        Err(e) if e.is_not_found() => {
            debug!("Service {} was not found, creating it", sm.name);
            client.create(sm).await
        }
        Err(e) => Err(e),
    }
}

/// Replace the service, keeping the revision tags set on the live service
pub async fn update(client: &dyn Client, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
    let current = client.get_service(&sm.name).await?;
    let mut desired = sm.clone();
    let traffic = preserve_revision_tags(&current.traffic(), &desired.traffic());
    desired.update_traffic(&traffic)?;
    client.update(&desired).await
}

/// Carry the tags of `current` over to `desired`. Tagged revisions no longer
/// receiving traffic are kept with 0 percent so their tag URLs stay reachable.
pub fn preserve_revision_tags(current: &[RevisionTraffic], desired: &[RevisionTraffic]) -> Vec<RevisionTraffic> {
    let tags: BTreeMap<&str, &str> = current
        .iter()
        .filter(|t| !t.revision_name.is_empty() && !t.tag.is_empty())
        .map(|t| (t.revision_name.as_str(), t.tag.as_str()))
        .collect();

    let mut out: Vec<RevisionTraffic> = desired
        .iter()
        .map(|t| {
            let mut t = t.clone();
            if t.tag.is_empty() {
                if let Some(tag) = tags.get(t.revision_name.as_str()) {
                    t.tag = tag.to_string();
                }
            }
            t
        })
        .collect();

    for (revision, tag) in tags {
        if out.iter().any(|t| t.revision_name == revision) {
            continue;
        }
        out.push(RevisionTraffic {
            revision_name: revision.to_string(),
            percent: 0,
            tag: tag.to_string(),
            latest_revision: false,
        });
    }
    out
}

/// Poll the revision until it is ready, it fails, or `timeout` elapses
pub async fn wait_revision_ready(
    client: &dyn Client,
    revision: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), PipedError> {
    let poll = async {
        loop {
            match client.get_revision(revision).await {
                Ok(r) => match r.status_conditions().readiness() {
                    Readiness::Ready => return Ok(()),
                    Readiness::Failed(reason) => {
                        return Err(PipedError::Validation(format!(
                            "revision {} failed to become ready: {}",
                            revision, reason
                        )))
                    }
                    Readiness::Pending(reason) => debug!("Revision {} is not ready yet: {}", revision, reason),
                },
                Err(e) if e.is_not_found() || e.is_retryable() => {
                    debug!("Revision {} is not available yet: {}", revision, e)
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.map_err(|_| {
        PipedError::Timeout(format!("revision {} did not become ready in {:?}", revision, timeout))
    })?
}

/// Compare the declared service with the live one
pub fn diff_service(declared: &ServiceManifest, live: &ServiceManifest) -> DiffResult {
    let mut live_body = live.body.clone();
    if let Some(root) = live_body.as_object_mut() {
        root.remove("status");
    }
    diff::diff(&declared.body, &live_body, &Options::live_state())
}

pub fn determine_versions(sm: &ServiceManifest) -> Result<Vec<ArtifactVersion>, PipedError> {
    let image = sm.image()?;
    let parsed = parse_container_image(image);
    Ok(vec![ArtifactVersion::container_image(parsed.name, parsed.tag, image)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn tagged(rev: &str, percent: u32, tag: &str) -> RevisionTraffic {
        RevisionTraffic {
            revision_name: rev.to_string(),
            percent,
            tag: tag.to_string(),
            latest_revision: false,
        }
    }

    #[test]
    fn test_preserve_revision_tags() {
        let current = vec![tagged("rev1", 50, "stable"), tagged("rev2", 50, "canary")];
        let desired = vec![RevisionTraffic::new("rev1", 80), RevisionTraffic::new("rev3", 20)];

        let got = preserve_revision_tags(&current, &desired);
        assert_eq!(
            got,
            vec![tagged("rev1", 80, "stable"), tagged("rev3", 20, ""), tagged("rev2", 0, "canary")]
        );
        assert_eq!(got.iter().map(|t| t.percent).sum::<u32>(), 100);
    }

    #[test]
    fn test_preserve_without_tags() {
        let current = vec![RevisionTraffic::new("rev1", 100)];
        let desired = vec![RevisionTraffic::new("rev2", 100)];
        assert_eq!(preserve_revision_tags(&current, &desired), desired);
    }

    fn revision(name: &str, conditions: Value) -> Revision {
        Revision::from_value(json!({
            "metadata": {"name": name},
            "status": {"conditions": conditions},
        }))
    }

    #[test]
    fn test_readiness() {
        let ready = revision(
            "r",
            json!([{"type": "Ready", "status": "True"}, {"type": "Active", "status": "True"}]),
        );
        assert!(matches!(ready.status_conditions().readiness(), Readiness::Ready));

        let pending = revision("r", json!([{"type": "Ready", "status": "Unknown"}]));
        assert!(matches!(pending.status_conditions().readiness(), Readiness::Pending(_)));

        let failed = revision(
            "r",
            json!([{"type": "Ready", "status": "True"}, {"type": "Active", "status": "True"},
                   {"type": "ContainerHealthy", "status": "False", "reason": "ExitCode1"}]),
        );
        match failed.status_conditions().readiness() {
            Readiness::Failed(reason) => assert!(reason.contains("ContainerHealthy")),
            _ => panic!("expected failure"),
        }
    }

    #[derive(Default)]
    struct FakeClient {
        services: Mutex<BTreeMap<String, ServiceManifest>>,
        revision_polls: Mutex<u32>,
        created: Mutex<u32>,
    }

    #[async_trait]
    impl Client for FakeClient {
        async fn create(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
            *self.created.lock().unwrap() += 1;
            self.services.lock().unwrap().insert(sm.name.clone(), sm.clone());
            Ok(sm.clone())
        }

        async fn update(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
            self.services.lock().unwrap().insert(sm.name.clone(), sm.clone());
            Ok(sm.clone())
        }

        async fn get_service(&self, name: &str) -> Result<ServiceManifest, PipedError> {
            self.services
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| PipedError::NotFound(name.to_string()))
        }

        async fn list_services(&self, _selector: &str) -> Result<Vec<ServiceManifest>, PipedError> {
            Ok(self.services.lock().unwrap().values().cloned().collect())
        }

        async fn get_revision(&self, name: &str) -> Result<Revision, PipedError> {
            let mut polls = self.revision_polls.lock().unwrap();
            *polls += 1;
            if *polls < 2 {
                return Err(PipedError::NotFound(name.to_string()));
            }
            Ok(revision(
                name,
                json!([{"type": "Ready", "status": "True"}, {"type": "Active", "status": "True"}]),
            ))
        }

        async fn list_revisions(&self, _selector: &str) -> Result<Vec<Revision>, PipedError> {
            Ok(Vec::new())
        }
    }

    fn service(traffic: &[RevisionTraffic]) -> ServiceManifest {
        let mut sm = ServiceManifest::parse(
            "metadata:\n  name: helloworld\nspec:\n  template:\n    spec:\n      containers:\n        - image: gcr.io/helloworld:v1.0.0\n",
        )
        .unwrap();
        sm.update_traffic(traffic).unwrap();
        sm
    }

    #[tokio::test]
    async fn test_apply_creates_then_updates_with_tags() {
        let client = FakeClient::default();
        apply(&client, &service(&[tagged("rev1", 100, "stable")])).await.unwrap();
        assert_eq!(*client.created.lock().unwrap(), 1);

        let second = service(&[RevisionTraffic::new("rev2", 100)]);
        apply(&client, &second).await.unwrap();
        apply(&client, &second).await.unwrap();
        assert_eq!(*client.created.lock().unwrap(), 1);

        let live = client.get_service("helloworld").await.unwrap();
        assert_eq!(
            live.traffic(),
            vec![RevisionTraffic::new("rev2", 100), tagged("rev1", 0, "stable")]
        );
    }

    #[tokio::test]
    async fn test_wait_revision_ready_retries_not_found() {
        let client = FakeClient::default();
        wait_revision_ready(&client, "rev", Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(*client.revision_polls.lock().unwrap(), 2);
    }

    #[test]
    fn test_diff_service_ignores_live_additions() {
        let declared = service(&[RevisionTraffic::new("rev1", 100)]);
        let mut live = declared.clone();
        live.body["metadata"]["generation"] = json!(3);
        live.body["status"] = json!({"url": "https://helloworld"});
        assert!(diff_service(&declared, &live).no_change());

        let changed = service(&[RevisionTraffic::new("rev2", 100)]);
        assert!(diff_service(&declared, &changed).has_diff());
    }
}
