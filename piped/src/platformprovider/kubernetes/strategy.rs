//! Decides between a quick sync and a progressive sync from the manifest changes

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::diff::diff_manifests;
use super::manifest::Manifest;
use super::resourcekey::{ResourceKey, KIND_DEPLOYMENT};
use crate::config::application::K8sResourceReference;
use crate::diff::{DiffResult, Node, Options};
use crate::model::ArtifactVersion;
use crate::platformprovider::parse_container_image;

const CONTAINER_IMAGE_QUERY: &str = r"^spec\.template\.spec\.containers\.\d+\.image$";
const REPLICAS_QUERY: &str = r"^spec\.replicas$";

/// Returns whether the change needs the progressive pipeline and a human readable reason.
pub fn decide_strategy(
    olds: &[Manifest],
    news: &[Manifest],
    workload_refs: &[K8sResourceReference],
) -> (bool, String) {
    let old_workloads = find_workloads(olds, workload_refs);
    if old_workloads.is_empty() {
        return (
            false,
            "Quick sync by applying all manifests because it was unable to find the currently running workloads".to_string(),
        );
    }
    let new_workloads = find_workloads(news, workload_refs);
    if new_workloads.is_empty() {
        return (
            false,
            "Quick sync by applying all manifests because it was unable to find workloads in the new manifests".to_string(),
        );
    }

    let options = Options::default();
    let mut diffs: Vec<(ResourceKey, DiffResult)> = Vec::new();
    for (old, new) in pair_workloads(&old_workloads, &new_workloads) {
        let result = diff_manifests(old, new, &options);
        let template_diffs: Vec<Node> = result
            .find_by_prefix("spec.template")
            .into_iter()
            .cloned()
            .collect();
        if !template_diffs.is_empty() {
            if let Some(desc) = check_image_change(&template_diffs) {
                return (true, desc);
            }
            return (
                true,
                format!(
                    "Sync progressively because pod template of workload {} was changed",
                    new.key.name
                ),
            );
        }
        diffs.push((new.key.clone(), result));
    }

    // A config or secret change has to be verified by the pipeline too
    let old_configs = find_configs(olds);
    let new_configs = find_configs(news);
    if old_configs.len() > new_configs.len() {
        return (
            true,
            format!(
                "Sync progressively because {} configmap/secret deleted",
                old_configs.len() - new_configs.len()
            ),
        );
    }
    if old_configs.len() < new_configs.len() {
        return (
            true,
            format!(
                "Sync progressively because new {} configmap/secret added",
                new_configs.len() - old_configs.len()
            ),
        );
    }
    for (key, old) in &old_configs {
        let Some(new) = new_configs.get(key) else {
            return (
                true,
                format!("Sync progressively because {} {} was deleted", key.kind, key.name),
            );
        };
        if diff_manifests(old, new, &options).has_diff() {
            return (
                true,
                format!("Sync progressively because {} {} was updated", key.kind, key.name),
            );
        }
    }

    let mut scales: Vec<String> = diffs
        .iter()
        .filter_map(|(key, result)| {
            let node = result.find(REPLICAS_QUERY).ok().flatten()?;
            Some(format!(
                "{}/{} from {} to {}",
                key.kind,
                key.name,
                display_or_unset(node.string_x()),
                display_or_unset(node.string_y())
            ))
        })
        .collect();
    scales.sort();
    if !scales.is_empty() {
        return (false, format!("Quick sync to scale {}", scales.join(", ")));
    }

    (false, "Quick sync by applying all manifests".to_string())
}

/// Workloads named by `refs`, every Deployment when no reference is configured
pub fn find_workloads<'a>(manifests: &'a [Manifest], refs: &[K8sResourceReference]) -> Vec<&'a Manifest> {
    if refs.is_empty() {
        return manifests.iter().filter(|m| m.kind() == KIND_DEPLOYMENT).collect();
    }
    let mut out = Vec::new();
    for r in refs {
        let kind = if r.kind.is_empty() { KIND_DEPLOYMENT } else { r.kind.as_str() };
        out.extend(
            manifests
                .iter()
                .filter(|m| m.kind() == kind && (r.name.is_empty() || m.name() == r.name)),
        );
    }
    out
}

/// Pair workloads across commits, ignoring API version upgrades and the default namespace
fn pair_workloads<'a>(olds: &[&'a Manifest], news: &[&'a Manifest]) -> Vec<(&'a Manifest, &'a Manifest)> {
    let old_map: HashMap<ResourceKey, &Manifest> =
        olds.iter().map(|m| (m.key.without_version(), *m)).collect();
    news.iter()
        .filter_map(|n| old_map.get(&n.key.without_version()).map(|o| (*o, *n)))
        .collect()
}

fn find_configs(manifests: &[Manifest]) -> BTreeMap<ResourceKey, &Manifest> {
    manifests
        .iter()
        .filter(|m| m.key.is_configmap() || m.key.is_secret())
        .map(|m| (m.key.clone(), m))
        .collect()
}

fn check_image_change(nodes: &[Node]) -> Option<String> {
    let pattern = crate::regexpool::default_pool().get(CONTAINER_IMAGE_QUERY).ok()?;
    let images: Vec<String> = nodes
        .iter()
        .filter(|n| pattern.is_match(&n.path_string))
        .map(|n| {
            let before = parse_container_image(&n.string_x());
            let after = parse_container_image(&n.string_y());
            if before.name == after.name {
                format!("image {} from {} to {}", before.name, before.tag, after.tag)
            } else {
                format!("image {}:{} to {}:{}", before.name, before.tag, after.name, after.tag)
            }
        })
        .collect();
    if images.is_empty() {
        return None;
    }
    Some(format!("Sync progressively because of updating {}", images.join(", ")))
}

fn display_or_unset(v: String) -> String {
    if v.is_empty() {
        "<unset>".to_string()
    } else {
        v
    }
}

/// Distinct container images used by the Deployments
pub fn determine_versions(manifests: &[Manifest]) -> Vec<ArtifactVersion> {
    let images: BTreeSet<String> = manifests
        .iter()
        .filter(|m| m.key.is_deployment())
        .flat_map(|m| m.container_images())
        .collect();
    images
        .into_iter()
        .map(|image| {
            let parsed = parse_container_image(&image);
            ArtifactVersion::container_image(parsed.name, parsed.tag, image)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platformprovider::kubernetes::manifest::parse_manifests;

    fn deployment(name: &str, spec: &str) -> Manifest {
        parse_manifests(&format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {}\nspec:\n{}",
            name, spec
        ))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_pod_template_changed() {
        let olds = vec![deployment("name", "  template: foo\n")];
        let news = vec![deployment("name", "  template: bar\n")];
        assert_eq!(
            decide_strategy(&olds, &news, &[]),
            (true, "Sync progressively because pod template of workload name was changed".to_string())
        );
    }

    #[test]
    fn test_scale_only() {
        let olds = vec![deployment("simple", "  replicas: 2\n  template: foo\n")];
        let news = vec![deployment("simple", "  replicas: 3\n  template: foo\n")];
        assert_eq!(
            decide_strategy(&olds, &news, &[]),
            (false, "Quick sync to scale Deployment/simple from 2 to 3".to_string())
        );
    }

    #[test]
    fn test_multiple_scales_are_sorted() {
        let olds = vec![
            deployment("name-2", "  replicas: 20\n  template: bar\n"),
            deployment("name-1", "  replicas: 1\n  template: foo\n"),
        ];
        let news = vec![
            deployment("name-2", "  replicas: 10\n  template: bar\n"),
            deployment("name-1", "  replicas: 5\n  template: foo\n"),
        ];
        assert_eq!(
            decide_strategy(&olds, &news, &[]).1,
            "Quick sync to scale Deployment/name-1 from 1 to 5, Deployment/name-2 from 20 to 10"
        );
    }

    #[test]
    fn test_image_changes() {
        let spec = |image: &str| {
            format!(
                "  template:\n    spec:\n      containers:\n        - name: app\n          image: {}\n",
                image
            )
        };
        let olds = vec![deployment("app", &spec("gcr.io/nginx:1.19.3"))];
        let news = vec![deployment("app", &spec("gcr.io/nginx:1.19.4"))];
        assert_eq!(
            decide_strategy(&olds, &news, &[]).1,
            "Sync progressively because of updating image nginx from 1.19.3 to 1.19.4"
        );

        let news = vec![deployment("app", &spec("redis:6.0.9"))];
        assert_eq!(
            decide_strategy(&olds, &news, &[]).1,
            "Sync progressively because of updating image nginx:1.19.3 to redis:6.0.9"
        );

        let news = vec![deployment("app", &spec("gcr.io/nginx@sha256:abc"))];
        let (progressive, desc) = decide_strategy(&olds, &news, &[]);
        assert!(progressive);
        assert_eq!(desc, "Sync progressively because of updating image nginx from 1.19.3 to sha256:abc");
    }

    #[test]
    fn test_config_changes() {
        let workload = deployment("app", "  template: foo\n");
        let config = |value: &str| {
            parse_manifests(&format!(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: conf\ndata:\n  key: {}\n",
                value
            ))
            .unwrap()
            .remove(0)
        };

        let olds = vec![workload.clone(), config("a")];
        let news = vec![workload.clone()];
        assert_eq!(
            decide_strategy(&olds, &news, &[]),
            (true, "Sync progressively because 1 configmap/secret deleted".to_string())
        );
        assert_eq!(
            decide_strategy(&news, &olds, &[]),
            (true, "Sync progressively because new 1 configmap/secret added".to_string())
        );

        let news = vec![workload.clone(), config("b")];
        assert_eq!(
            decide_strategy(&olds, &news, &[]),
            (true, "Sync progressively because ConfigMap conf was updated".to_string())
        );

        assert_eq!(
            decide_strategy(&olds, &olds, &[]),
            (false, "Quick sync by applying all manifests".to_string())
        );
    }

    #[test]
    fn test_workload_refs_and_missing_workloads() {
        let olds = vec![deployment("name-1", "  template: foo\n"), deployment("name-2", "  template: foo\n")];
        let news = vec![deployment("name-1", "  template: foo\n"), deployment("name-2", "  template: bar\n")];
        let refs = vec![K8sResourceReference {
            kind: "Deployment".to_string(),
            name: "name-1".to_string(),
        }];
        assert_eq!(
            decide_strategy(&olds, &news, &refs),
            (false, "Quick sync by applying all manifests".to_string())
        );

        let (progressive, desc) = decide_strategy(&[], &news, &[]);
        assert!(!progressive);
        assert!(desc.contains("unable to find the currently running workloads"));
    }

    #[test]
    fn test_determine_versions() {
        let spec = "  template:\n    spec:\n      containers:\n        - image: gcr.io/pipecd/helloworld:v0.1.0\n        - image: envoy:v1.10.0\n";
        let manifests = vec![deployment("a", spec), deployment("b", spec)];
        let versions = determine_versions(&manifests);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].name, "envoy");
        assert_eq!(versions[1].version, "v0.1.0");
        assert_eq!(versions[1].url, "gcr.io/pipecd/helloworld:v0.1.0");
    }
}
