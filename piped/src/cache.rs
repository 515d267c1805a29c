//! In-memory cache of loaded application manifests

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

const DEFAULT_CAPACITY: u64 = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Manifests keyed by `(application id, commit hash)`.
///
/// The first value stored under a key wins, later puts for the same key are ignored.
pub struct AppManifestsCache<T: Send + Sync + 'static> {
    inner: Cache<String, Arc<T>>,
}

impl<T: Send + Sync + 'static> AppManifestsCache<T> {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(DEFAULT_TTL)
                .build(),
        }
    }

    pub fn get(&self, app_id: &str, commit: &str) -> Option<Arc<T>> {
        self.inner.get(&cache_key(app_id, commit))
    }

    /// Store `value` unless the key is already present; returns the stored value
    pub fn put(&self, app_id: &str, commit: &str, value: T) -> Arc<T> {
        self.inner
            .get_with(cache_key(app_id, commit), move || Arc::new(value))
    }
}

impl<T: Send + Sync + 'static> Default for AppManifestsCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn cache_key(app_id: &str, commit: &str) -> String {
    format!("{}/{}", app_id, commit)
}
