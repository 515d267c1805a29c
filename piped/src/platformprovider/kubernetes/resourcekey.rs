use std::cmp::Ordering;
use std::fmt;

use crate::errors::PipedError;

pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_REPLICASET: &str = "ReplicaSet";
pub const KIND_DAEMONSET: &str = "DaemonSet";
pub const KIND_POD: &str = "Pod";
pub const KIND_CONFIGMAP: &str = "ConfigMap";
pub const KIND_SECRET: &str = "Secret";

pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies one resource in the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse the `apiVersion:kind:namespace:name` form
    pub fn decode(s: &str) -> Result<Self, PipedError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(PipedError::Validation(format!("malformed resource key: {}", s)));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }

    pub fn readable_string(&self) -> String {
        format!(
            "name={:?}, kind={:?}, namespace={:?}, apiVersion={:?}",
            self.name, self.kind, self.namespace, self.api_version
        )
    }

    pub fn is_deployment(&self) -> bool {
        self.kind == KIND_DEPLOYMENT && is_known_group(&self.api_version, &["apps/v1", "apps/v1beta1", "apps/v1beta2", "extensions/v1beta1"])
    }

    pub fn is_replicaset(&self) -> bool {
        self.kind == KIND_REPLICASET
    }

    pub fn is_workload(&self) -> bool {
        matches!(
            self.kind.as_str(),
            KIND_DEPLOYMENT | KIND_REPLICASET | KIND_DAEMONSET | KIND_POD
        )
    }

    pub fn is_configmap(&self) -> bool {
        self.kind == KIND_CONFIGMAP && self.api_version == "v1"
    }

    pub fn is_secret(&self) -> bool {
        self.kind == KIND_SECRET && self.api_version == "v1"
    }

    /// Same key with the namespace normalized and the API version dropped,
    /// used to pair a resource across an API version upgrade.
    pub fn without_version(&self) -> Self {
        let namespace = if self.namespace == DEFAULT_NAMESPACE {
            String::new()
        } else {
            self.namespace.clone()
        };
        Self {
            api_version: String::new(),
            kind: self.kind.clone(),
            namespace,
            name: self.name.clone(),
        }
    }

    pub fn cmp_ignoring_namespace(&self, other: &Self) -> Ordering {
        (&self.api_version, &self.kind, &self.name).cmp(&(&other.api_version, &other.kind, &other.name))
    }

    pub fn eq_ignoring_namespace(&self, other: &Self) -> bool {
        self.cmp_ignoring_namespace(other) == Ordering::Equal
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.api_version, self.kind, self.namespace, self.name)
    }
}

fn is_known_group(api_version: &str, groups: &[&str]) -> bool {
    groups.contains(&api_version)
}
