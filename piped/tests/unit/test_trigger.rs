//! Deciding which applications a commit touches

use piped::filematcher::PatternMatcher;
use piped::trigger::touched_by_changes;
use tokio_test::{assert_err, assert_ok};

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_changes_inside_the_application_directory() {
    let changed = strings(&["apps/web/deployment.yaml"]);
    assert!(touched_by_changes("apps/web", &[], &changed).unwrap());
    assert!(touched_by_changes("./apps/web/", &[], &changed).unwrap());
    assert!(!touched_by_changes("apps/webhook", &[], &changed).unwrap());
}

#[test]
fn test_application_at_repository_root() {
    assert!(touched_by_changes(".", &[], &strings(&["README.md"])).unwrap());
    assert!(!touched_by_changes("", &[], &[]).unwrap());
}

#[test]
fn test_extra_trigger_paths() {
    let paths = strings(&["shared/**", "!shared/docs/**"]);
    assert!(touched_by_changes("apps/web", &paths, &strings(&["shared/values.yaml"])).unwrap());
    assert!(!touched_by_changes("apps/web", &paths, &strings(&["shared/docs/index.md"])).unwrap());
    assert_err!(touched_by_changes("apps/web", &strings(&["!"]), &strings(&["other.txt"])));
}

#[test]
fn test_pattern_matcher_lists_positive_patterns() {
    let pm = assert_ok!(PatternMatcher::new(&["./charts/**", "!charts/tmp/**", ""]));
    assert_eq!(pm.patterns(), ["charts/**"]);
    assert!(pm.matches("charts/web/values.yaml"));
    assert!(!pm.matches("charts/tmp/cache"));
}
