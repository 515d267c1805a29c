//! Deployment metadata with write-through persistence
//!
//! Two scopes: values shared by every stage of the deployment (traffic
//! snapshots taken for a later rollback) and values private to one stage
//! (resume points such as the wait start time). Reads are served from the
//! local cache, seeded with what the control plane returned with the
//! deployment, so a restarted piped picks up where the previous run stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::PipedError;
use crate::http::PipedApi;
use crate::model::Deployment;

struct Inner {
    api: Arc<dyn PipedApi>,
    deployment_id: String,
    shared: Mutex<HashMap<String, String>>,
    stages: Mutex<HashMap<String, HashMap<String, String>>>,
}

#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<Inner>,
}

impl MetadataStore {
    pub fn new(api: Arc<dyn PipedApi>, deployment: &Deployment) -> Self {
        let stages = deployment
            .stages
            .iter()
            .map(|s| (s.id.clone(), s.metadata.clone()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                api,
                deployment_id: deployment.id.clone(),
                shared: Mutex::new(deployment.metadata.clone()),
                stages: Mutex::new(stages),
            }),
        }
    }

    pub fn shared(&self) -> SharedMetadata {
        SharedMetadata {
            inner: self.inner.clone(),
        }
    }

    pub fn stage(&self, stage_id: &str) -> StageMetadata {
        StageMetadata {
            inner: self.inner.clone(),
            stage_id: stage_id.to_string(),
        }
    }
}

fn poisoned() -> PipedError {
    PipedError::Internal("metadata cache lock poisoned".to_string())
}

/// Deployment-wide scope
#[derive(Clone)]
pub struct SharedMetadata {
    inner: Arc<Inner>,
}

impl SharedMetadata {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.shared.lock().ok()?.get(key).cloned()
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), PipedError> {
        let mut md = HashMap::new();
        md.insert(key.to_string(), value.to_string());
        self.put_multi(md).await
    }

    /// Persist every entry, then make them visible to readers
    pub async fn put_multi(&self, md: HashMap<String, String>) -> Result<(), PipedError> {
        self.inner
            .api
            .save_deployment_metadata(&self.inner.deployment_id, &md)
            .await?;
        self.inner.shared.lock().map_err(|_| poisoned())?.extend(md);
        Ok(())
    }
}

/// Scope of a single stage
#[derive(Clone)]
pub struct StageMetadata {
    inner: Arc<Inner>,
    stage_id: String,
}

impl StageMetadata {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .stages
            .lock()
            .ok()?
            .get(&self.stage_id)
            .and_then(|md| md.get(key))
            .cloned()
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), PipedError> {
        let mut md = HashMap::new();
        md.insert(key.to_string(), value.to_string());
        self.put_multi(md).await
    }

    pub async fn put_multi(&self, md: HashMap<String, String>) -> Result<(), PipedError> {
        self.inner
            .api
            .save_stage_metadata(&self.inner.deployment_id, &self.stage_id, &md)
            .await?;
        self.inner
            .stages
            .lock()
            .map_err(|_| poisoned())?
            .entry(self.stage_id.clone())
            .or_default()
            .extend(md);
        Ok(())
    }

    /// Store `value` unless the key already has one. Returns the value in effect.
    pub async fn put_if_absent(&self, key: &str, value: &str) -> Result<String, PipedError> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        self.put(key, value).await?;
        Ok(value.to_string())
    }
}
