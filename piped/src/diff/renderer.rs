use std::fmt::Write;

use serde_json::Value;

use super::result::{Node, PathStep};

/// Renders diff nodes as grouped `-`/`+` YAML-like text
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    left_padding: usize,
    redact_path_prefix: String,
    redact_replacement_x: String,
    redact_replacement_y: String,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_left_padding(mut self, padding: usize) -> Self {
        self.left_padding = padding;
        self
    }

    /// Values under `prefix` are replaced with the given placeholders
    pub fn with_redact_path(
        mut self,
        prefix: impl Into<String>,
        replacement_x: impl Into<String>,
        replacement_y: impl Into<String>,
    ) -> Self {
        self.redact_path_prefix = prefix.into();
        self.redact_replacement_x = replacement_x.into();
        self.redact_replacement_y = replacement_y.into();
        self
    }

    pub fn render(&self, nodes: &[Node]) -> String {
        let mut b = String::new();
        let mut pre_path: &[PathStep] = &[];

        for n in nodes {
            let Some(last_step) = n.path.last() else {
                continue;
            };
            let dup = path_duplicate_depth(&n.path, pre_path);
            pre_path = &n.path;
            let _ = writeln!(
                b,
                "{:w$}#{}",
                "",
                n.path_string,
                w = (self.left_padding + dup) * 2
            );

            let mut array = false;
            for i in dup..n.path.len() - 1 {
                let step = &n.path[i];
                if step.is_index() {
                    let _ = write!(b, "{:w$}- ", "", w = (self.left_padding + i) * 2);
                    array = true;
                    continue;
                }
                if array {
                    let _ = writeln!(b, "{}:", step);
                    array = false;
                    continue;
                }
                let _ = writeln!(b, "{:w$}{}:", "", step, w = (self.left_padding + i) * 2);
            }

            let redacted = !self.redact_path_prefix.is_empty()
                && n.path_string.starts_with(&self.redact_path_prefix);
            let (vx, vy) = if redacted {
                (
                    Some(Value::String(self.redact_replacement_x.clone())),
                    Some(Value::String(self.redact_replacement_y.clone())),
                )
            } else {
                (n.value_x.clone(), n.value_y.clone())
            };

            let depth = self.left_padding + n.path.len() - 1;
            print_value(&mut b, "-", vx.as_ref(), last_step, depth);
            print_value(&mut b, "+", vy.as_ref(), last_step, depth);
        }

        b
    }
}

fn print_value(b: &mut String, mark: &str, v: Option<&Value>, last_step: &PathStep, depth: usize) {
    let (node_string, mut nl) = render_node_value(v, "");
    if node_string.is_empty() {
        return;
    }
    let is_index = last_step.is_index();
    if is_index {
        nl = false;
    }

    // A zero depth still leaves one column between the mark and the value
    let head = (depth * 2).saturating_sub(1).max(1);
    let body = depth * 2 + 1;

    if is_index {
        let _ = write!(b, "{}{:w$}- ", mark, "", w = head);
    } else if nl {
        let _ = writeln!(b, "{}{:w$}{}:", mark, "", last_step, w = head);
    } else {
        let _ = write!(b, "{}{:w$}{}: ", mark, "", last_step, w = head);
    }

    for (i, p) in node_string.split('\n').enumerate() {
        if !is_index {
            if nl {
                let _ = writeln!(b, "{}{:w$}{}", mark, "", p, w = body);
            } else {
                let _ = writeln!(b, "{}", p);
            }
            continue;
        }
        if i == 0 {
            let _ = writeln!(b, "{}", p);
            continue;
        }
        let _ = writeln!(b, "{}{:w$}{}", mark, "", p, w = body);
    }
}

fn path_duplicate_depth(x: &[PathStep], y: &[PathStep]) -> usize {
    let min_len = x.len().min(y.len());
    for i in 0..min_len {
        if x[i] != y[i] {
            return i;
        }
    }
    0
}

/// Render a value as YAML-like text. The flag reports whether the output is
/// multi-line and must start on its own line.
pub fn render_node_value(v: Option<&Value>, prefix: &str) -> (String, bool) {
    let Some(v) = v else {
        return (String::new(), false);
    };

    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let child_prefix = format!("{}  ", prefix);
            let mut out = Vec::with_capacity(keys.len());
            for k in keys {
                let (sub, nl) = render_node_value(map.get(k.as_str()), &child_prefix);
                if nl {
                    out.push(format!("{}{}:\n{}", prefix, k, sub));
                } else {
                    out.push(format!("{}{}: {}", prefix, k, sub));
                }
            }
            if out.is_empty() {
                return (String::new(), false);
            }
            (out.join("\n"), true)
        }
        Value::Array(items) => {
            let child_prefix = format!("{}  ", prefix);
            let mut out = Vec::new();
            for item in items {
                let (sub, _) = render_node_value(Some(item), &child_prefix);
                for (i, p) in sub.split('\n').enumerate() {
                    let p = p.strip_prefix(child_prefix.as_str()).unwrap_or(p);
                    if i == 0 {
                        out.push(format!("{}- {}", prefix, p));
                    } else {
                        out.push(format!("{}  {}", prefix, p));
                    }
                }
            }
            (out.join("\n"), true)
        }
        Value::String(s) => (s.clone(), false),
        Value::Number(n) => {
            let s = if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(|f| f.to_string()).unwrap_or_default()
            };
            (s, false)
        }
        Value::Bool(b) => (b.to_string(), false),
        Value::Null => (String::new(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{diff, Options};
    use serde_json::json;

    #[test]
    fn test_render_scalar_change() {
        let x = json!({ "spec": { "replicas": 2 } });
        let y = json!({ "spec": { "replicas": 3 } });
        let result = diff(&x, &y, &Options::default());
        let got = Renderer::new().render(result.nodes());
        let expected = "#spec.replicas\nspec:\n- replicas: 2\n+ replicas: 3\n";
        assert_eq!(got, expected);
    }

    #[test]
    fn test_render_groups_common_prefix() {
        let x = json!({ "spec": { "a": "1", "b": "2" } });
        let y = json!({ "spec": { "a": "3", "b": "4" } });
        let result = diff(&x, &y, &Options::default());
        let got = Renderer::new().with_left_padding(1).render(result.nodes());
        let expected = concat!(
            "  #spec.a\n",
            "  spec:\n",
            "-   a: 1\n",
            "+   a: 3\n",
            "    #spec.b\n",
            "-   b: 2\n",
            "+   b: 4\n",
        );
        assert_eq!(got, expected);
    }

    #[test]
    fn test_render_redacted() {
        let x = json!({ "data": { "password": "old" } });
        let y = json!({ "data": { "password": "new" } });
        let result = diff(&x, &y, &Options::default());
        let got = Renderer::new()
            .with_redact_path("data", "*****", "***** (changed)")
            .render(result.nodes());
        assert!(got.contains("*****"));
        assert!(!got.contains("old"));
        assert!(!got.contains("new\n"));
    }

    #[test]
    fn test_render_node_value_nested() {
        let v = json!({ "b": [1, { "c": "d" }], "a": "x" });
        let (s, nl) = render_node_value(Some(&v), "");
        assert!(nl);
        assert_eq!(s, "a: x\nb:\n  - 1\n  - c: d");
    }
}
