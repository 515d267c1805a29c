//! Runtime adapters, one module per application kind
//!
//! The kinds share no manifest type. Each module exposes its own manifest
//! envelope, a `Client` trait over the runtime API and the helpers the
//! planner, the executors and the drift detector need.

pub mod aws;
pub mod cloudrun;
pub mod ecs;
pub mod kubernetes;
pub mod lambda;
pub mod terraform;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::info;

use crate::config::piped::{PlatformProvider, PlatformProviderConfig};
use crate::errors::PipedError;
use crate::model::ApplicationKind;
use crate::toolregistry::ToolRegistry;
use crate::utils::short_hash;

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_PIPED: &str = "piped";
pub const LABEL_APPLICATION: &str = "application";
pub const LABEL_COMMIT_HASH: &str = "commit-hash";
pub const LABEL_REVISION_NAME: &str = "revision-name";
pub const MANAGED_BY_PIPED: &str = "piped";

/// Labels piped puts on every resource it applies.
///
/// `prefix` namespaces the keys the way the runtime allows ("pipecd.dev/" for
/// Kubernetes, "pipecd-dev-" where slashes are forbidden).
pub fn builtin_labels(prefix: &str, piped_id: &str, app_id: &str, commit: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(format!("{}{}", prefix, LABEL_MANAGED_BY), MANAGED_BY_PIPED.to_string());
    labels.insert(format!("{}{}", prefix, LABEL_PIPED), piped_id.to_string());
    labels.insert(format!("{}{}", prefix, LABEL_APPLICATION), app_id.to_string());
    labels.insert(format!("{}{}", prefix, LABEL_COMMIT_HASH), commit.to_string());
    labels
}

/// `key=value` selector matching resources managed by piped
pub fn managed_by_piped_selector(prefix: &str) -> String {
    format!("{}{}={}", prefix, LABEL_MANAGED_BY, MANAGED_BY_PIPED)
}

/// `{name}-{version without dots}-{commit prefix}`, the same inputs always give the same name
pub fn decide_revision_name(name: &str, version: &str, commit: &str) -> String {
    format!("{}-{}-{}", name, version.replace('.', ""), short_hash(commit))
}

/// Parsed container image reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerImage {
    /// Last path component of the repository, e.g. "helloworld"
    pub name: String,
    /// Tag, or the digest (`sha256:...`) for digest references
    pub tag: String,
    pub digest: bool,
}

/// Split `registry/path/name:tag` or `registry/path/name@sha256:...`.
pub fn parse_container_image(image: &str) -> ContainerImage {
    let (repository, tag, digest) = match image.split_once('@') {
        Some((repo, digest)) => (repo, digest.to_string(), true),
        None => {
            // A colon before the last slash belongs to a registry port
            let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
            match image[last_slash..].rfind(':') {
                Some(i) => (
                    &image[..last_slash + i],
                    image[last_slash + i + 1..].to_string(),
                    false,
                ),
                None => (image, String::new(), false),
            }
        }
    };
    let name = repository.rsplit('/').next().unwrap_or_default().to_string();
    ContainerImage { name, tag, digest }
}

/// Deduplicates client construction per platform provider name.
///
/// Concurrent lookups of the same name wait for one construction and share its result.
pub struct ClientRegistry<C: ?Sized + Send + Sync> {
    clients: Mutex<HashMap<String, Arc<OnceCell<Arc<C>>>>>,
}

impl<C: ?Sized + Send + Sync> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: ?Sized + Send + Sync> ClientRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create<F, Fut>(&self, name: &str, create: F) -> Result<Arc<C>, PipedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>, PipedError>>,
    {
        let cell = {
            let mut clients = self
                .clients
                .lock()
                .map_err(|_| PipedError::Internal("client registry lock poisoned".to_string()))?;
            clients.entry(name.to_string()).or_default().clone()
        };
        let client = cell.get_or_try_init(create).await?;
        Ok(client.clone())
    }

    /// Register a ready-made client, replacing any previous one
    pub fn insert(&self, name: &str, client: Arc<C>) -> Result<(), PipedError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| PipedError::Internal("client registry lock poisoned".to_string()))?;
        clients.insert(name.to_string(), Arc::new(OnceCell::new_with(Some(client))));
        Ok(())
    }
}

/// Lazily built runtime clients, one per platform provider
pub struct PlatformClients {
    tool_registry: Arc<ToolRegistry>,
    pub kubernetes: ClientRegistry<dyn kubernetes::Applier>,
    pub cloudrun: ClientRegistry<dyn cloudrun::Client>,
    pub lambda: ClientRegistry<dyn lambda::Client>,
    pub ecs: ClientRegistry<dyn ecs::Client>,
}

impl PlatformClients {
    pub fn new(tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            tool_registry,
            kubernetes: ClientRegistry::new(),
            cloudrun: ClientRegistry::new(),
            lambda: ClientRegistry::new(),
            ecs: ClientRegistry::new(),
        }
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    /// kubectl of the requested version (the provider's one when empty) bound to the provider cluster
    pub async fn kubernetes(
        &self,
        provider: &PlatformProvider,
        kubectl_version: &str,
    ) -> Result<Arc<dyn kubernetes::Applier>, PipedError> {
        let PlatformProviderConfig::Kubernetes(config) = &provider.config else {
            return Err(kind_mismatch(provider, ApplicationKind::Kubernetes));
        };
        let version = if kubectl_version.is_empty() {
            config.kubectl_version.as_str()
        } else {
            kubectl_version
        };
        let key = format!("{}@{}", provider.name, version);
        self.kubernetes
            .get_or_create(&key, || async move {
                let (path, installed) = self.tool_registry.kubectl(version).await?;
                if installed {
                    info!("Installed kubectl {} for platform provider {}", version, provider.name);
                }
                Ok(Arc::new(kubernetes::Kubectl::new(path, config)) as Arc<dyn kubernetes::Applier>)
            })
            .await
    }

    pub async fn cloudrun(&self, provider: &PlatformProvider) -> Result<Arc<dyn cloudrun::Client>, PipedError> {
        let PlatformProviderConfig::CloudRun(config) = &provider.config else {
            return Err(kind_mismatch(provider, ApplicationKind::CloudRun));
        };
        self.cloudrun
            .get_or_create(&provider.name, || async move {
                Ok(Arc::new(cloudrun::RestClient::new(config)?) as Arc<dyn cloudrun::Client>)
            })
            .await
    }

    pub async fn lambda(&self, provider: &PlatformProvider) -> Result<Arc<dyn lambda::Client>, PipedError> {
        let PlatformProviderConfig::Lambda(config) = &provider.config else {
            return Err(kind_mismatch(provider, ApplicationKind::Lambda));
        };
        self.lambda
            .get_or_create(&provider.name, || async move {
                Ok(Arc::new(lambda::AwsCliClient::new(config)?) as Arc<dyn lambda::Client>)
            })
            .await
    }

    pub async fn ecs(&self, provider: &PlatformProvider) -> Result<Arc<dyn ecs::Client>, PipedError> {
        let PlatformProviderConfig::Ecs(config) = &provider.config else {
            return Err(kind_mismatch(provider, ApplicationKind::Ecs));
        };
        self.ecs
            .get_or_create(&provider.name, || async move {
                Ok(Arc::new(ecs::AwsCliClient::new(config)?) as Arc<dyn ecs::Client>)
            })
            .await
    }
}

fn kind_mismatch(provider: &PlatformProvider, expected: ApplicationKind) -> PipedError {
    PipedError::Config(format!(
        "platform provider {} is not a {} provider (got {})",
        provider.name,
        expected,
        provider.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_decide_revision_name() {
        assert_eq!(
            decide_revision_name("helloworld", "v0.5.0", "bbdc2ed674ce4fd987"),
            "helloworld-v050-bbdc2ed"
        );
        assert_eq!(
            decide_revision_name("helloworld", "v0.5.0", "bbdc2ed674ce4fd987"),
            decide_revision_name("helloworld", "v0.5.0", "bbdc2ed674ce4fd987"),
        );
        assert_eq!(decide_revision_name("fn", "1", "abc"), "fn-1-abc");
    }

    #[test]
    fn test_parse_container_image() {
        let img = parse_container_image("gcr.io/pipecd/helloworld:v0.5.0");
        assert_eq!(img.name, "helloworld");
        assert_eq!(img.tag, "v0.5.0");
        assert!(!img.digest);

        let img = parse_container_image("localhost:5000/app");
        assert_eq!(img.name, "app");
        assert_eq!(img.tag, "");

        let img = parse_container_image("gcr.io/pipecd/helloworld@sha256:abcdef");
        assert_eq!(img.name, "helloworld");
        assert_eq!(img.tag, "sha256:abcdef");
        assert!(img.digest);

        let img = parse_container_image("nginx");
        assert_eq!(img.name, "nginx");
        assert_eq!(img.tag, "");
    }

    #[test]
    fn test_builtin_labels() {
        let labels = builtin_labels("pipecd.dev/", "piped-1", "app-1", "abc");
        assert_eq!(labels.len(), 4);
        assert_eq!(labels["pipecd.dev/managed-by"], "piped");
        assert_eq!(labels["pipecd.dev/commit-hash"], "abc");
        assert_eq!(managed_by_piped_selector("pipecd.dev/"), "pipecd.dev/managed-by=piped");
    }

    #[tokio::test]
    async fn test_client_registry_single_construction() {
        let registry: Arc<ClientRegistry<String>> = Arc::new(ClientRegistry::new());
        let built = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let built = built.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create("provider-1", || async move {
                        built.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(Arc::new("client".to_string()))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().as_str(), "client");
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_registry_retries_after_failure() {
        let registry: ClientRegistry<String> = ClientRegistry::new();
        let err = registry
            .get_or_create("p", || async { Err(PipedError::Config("bad".into())) })
            .await;
        assert!(err.is_err());
        let ok = registry
            .get_or_create("p", || async { Ok(Arc::new("ok".to_string())) })
            .await
            .unwrap();
        assert_eq!(ok.as_str(), "ok");
    }
}
