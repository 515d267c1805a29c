use std::cmp::Ordering;
use std::fmt::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use super::manifest::Manifest;
use super::resourcekey::ResourceKey;
use crate::diff::{self, diff_by_command, DiffResult, Options, Renderer, DIFF_COMMAND};
use crate::errors::PipedError;

const MASK: &str = "*****";

/// Compare two versions of the same resource.
pub fn diff_manifests(old: &Manifest, new: &Manifest, options: &Options) -> DiffResult {
    if old.key.is_secret() && new.key.is_secret() {
        let old_body = normalize_old_secret(&old.body, &new.body);
        return diff::diff(&old_body, &new.body, options);
    }
    diff::diff(&old.body, &new.body, options)
}

/// Secrets read back from the cluster only carry base64 `data`. Keys the new
/// manifest declares in `stringData` are decoded into `stringData` on the old side
/// so both sides use the same representation.
fn normalize_old_secret(old: &Value, new: &Value) -> Value {
    let Some(new_string_data) = new.get("stringData").and_then(Value::as_object) else {
        return old.clone();
    };
    let mut old = old.clone();
    let Some(root) = old.as_object_mut() else {
        return old;
    };

    let mut moved = Map::new();
    if let Some(Value::Object(data)) = root.get_mut("data") {
        let keys: Vec<String> = data
            .keys()
            .filter(|k| new_string_data.contains_key(*k))
            .cloned()
            .collect();
        for k in keys {
            let Some(encoded) = data.get(&k).and_then(Value::as_str) else {
                continue;
            };
            let Ok(decoded) = STANDARD.decode(encoded) else {
                continue;
            };
            let Ok(decoded) = String::from_utf8(decoded) else {
                continue;
            };
            data.remove(&k);
            moved.insert(k, Value::String(decoded));
        }
        if data.is_empty() {
            root.remove("data");
        }
    }
    if !moved.is_empty() {
        let string_data = root
            .entry("stringData".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(sd) = string_data {
            sd.extend(moved);
        }
    }
    old
}

#[derive(Debug, Clone)]
pub struct DiffChange {
    pub old: Manifest,
    pub new: Manifest,
    pub diff: DiffResult,
}

/// Differences between two sets of manifests
#[derive(Debug, Clone, Default)]
pub struct DiffListResult {
    pub adds: Vec<Manifest>,
    pub deletes: Vec<Manifest>,
    pub changes: Vec<DiffChange>,
}

#[derive(Debug, Clone, Default)]
pub struct DiffRenderOptions {
    pub mask_secret: bool,
    pub mask_configmap: bool,
    /// Maximum number of changed manifests to print, 0 for all
    pub max_changed_manifests: usize,
    /// Render changes with the external `diff` command where masking is not needed
    pub use_diff_command: bool,
}

impl DiffListResult {
    pub fn no_change(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty() && self.changes.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.adds.len() + self.deletes.len() + self.changes.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added manifests, {} changed manifests, {} deleted manifests",
            self.adds.len(),
            self.changes.len(),
            self.deletes.len()
        )
    }

    pub async fn render(&self, opts: &DiffRenderOptions) -> String {
        let mut b = String::new();
        let mut index = 0;
        for m in &self.deletes {
            index += 1;
            let _ = write!(b, "- {}. {}\n\n", index, m.key.readable_string());
        }
        for m in &self.adds {
            index += 1;
            let _ = write!(b, "+ {}. {}\n\n", index, m.key.readable_string());
        }

        let max_print = match opts.max_changed_manifests {
            0 => self.changes.len(),
            n => n.min(self.changes.len()),
        };
        for change in &self.changes[..max_print] {
            let key = &change.old.key;
            index += 1;
            let _ = write!(b, "# {}. {}\n\n", index, key.readable_string());

            let masked = (opts.mask_secret && key.is_secret())
                || (opts.mask_configmap && key.is_configmap());
            let mut renderer = Renderer::new().with_left_padding(1);
            if masked {
                renderer = renderer.with_redact_path("data", MASK, MASK);
            }

            if !opts.use_diff_command || masked {
                b.push_str(&renderer.render(change.diff.nodes()));
            } else {
                match render_by_command(&change.old, &change.new).await {
                    Ok(out) => b.push_str(&out),
                    Err(e) => {
                        let _ = writeln!(b, "failed to run diff command ({})", e);
                        b.push_str(&renderer.render(change.diff.nodes()));
                    }
                }
            }
            b.push('\n');
        }

        if max_print < self.changes.len() {
            let _ = writeln!(
                b,
                "... (omitted {} other changed manifests",
                self.changes.len() - max_print
            );
        }
        b
    }
}

async fn render_by_command(old: &Manifest, new: &Manifest) -> Result<String, PipedError> {
    diff_by_command(DIFF_COMMAND, &old.to_yaml()?, &new.to_yaml()?).await
}

/// Pair `olds` and `news` by resource key (namespace ignored) and diff every pair.
/// Only pairs with at least one difference are reported as changes.
pub fn diff_list(olds: &[Manifest], news: &[Manifest], options: &Options) -> DiffListResult {
    let (adds, deletes, pairs) = group_manifests(olds, news);
    let mut result = DiffListResult {
        adds,
        deletes,
        changes: Vec::new(),
    };
    for (old, new) in pairs {
        let diff = diff_manifests(&old, &new, options);
        if diff.has_diff() {
            result.changes.push(DiffChange { old, new, diff });
        }
    }
    result
}

type Grouped = (Vec<Manifest>, Vec<Manifest>, Vec<(Manifest, Manifest)>);

fn group_manifests(olds: &[Manifest], news: &[Manifest]) -> Grouped {
    let sorted = |ms: &[Manifest]| {
        let mut ms = ms.to_vec();
        ms.sort_by(|a, b| a.key.cmp_ignoring_namespace(&b.key));
        ms
    };
    let olds = sorted(olds);
    let news = sorted(news);

    let (mut adds, mut deletes, mut pairs) = (Vec::new(), Vec::new(), Vec::new());
    let (mut o, mut n) = (0, 0);
    while o < olds.len() && n < news.len() {
        match compare(&olds[o].key, &news[n].key) {
            Ordering::Equal => {
                pairs.push((olds[o].clone(), news[n].clone()));
                o += 1;
                n += 1;
            }
            Ordering::Less => {
                deletes.push(olds[o].clone());
                o += 1;
            }
            Ordering::Greater => {
                adds.push(news[n].clone());
                n += 1;
            }
        }
    }
    deletes.extend_from_slice(&olds[o..]);
    adds.extend_from_slice(&news[n..]);
    (adds, deletes, pairs)
}

fn compare(a: &ResourceKey, b: &ResourceKey) -> Ordering {
    a.cmp_ignoring_namespace(b)
}
