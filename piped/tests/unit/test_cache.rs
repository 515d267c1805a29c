//! Manifests cache unit tests

use std::sync::Arc;

use piped::cache::AppManifestsCache;
use piped::platformprovider::kubernetes::{parse_manifests, Manifest};

fn manifests(name: &str) -> Vec<Manifest> {
    parse_manifests(&format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  key: value\n",
        name
    ))
    .unwrap()
}

#[test]
fn test_manifests_cache_is_keyed_by_application_and_commit() {
    let cache: AppManifestsCache<Vec<Manifest>> = AppManifestsCache::new(10);

    cache.put("app-1", "abc", manifests("first"));
    cache.put("app-2", "abc", manifests("second"));

    let entry = cache.get("app-1", "abc").unwrap();
    assert_eq!(entry.len(), 1);
    assert_eq!(entry[0].key.name, "first");
    assert_eq!(cache.get("app-2", "abc").unwrap()[0].key.name, "second");
    assert!(cache.get("app-1", "def").is_none());
}

#[test]
fn test_manifests_cache_keeps_the_first_value() {
    let cache: AppManifestsCache<Vec<Manifest>> = AppManifestsCache::default();

    let stored = cache.put("app-1", "abc", manifests("first"));
    let again = cache.put("app-1", "abc", manifests("other"));

    assert!(Arc::ptr_eq(&stored, &again));
    assert_eq!(again[0].key.name, "first");
}
