//! Structural diff of YAML/JSON trees
//!
//! Values are compared as `serde_json::Value`. YAML documents are converted
//! before comparison so the same engine serves every runtime.

mod command;
mod renderer;
mod result;

use serde_json::{Map, Value};

pub use command::{diff_by_command, render_unified, DIFF_COMMAND};
pub use renderer::{render_node_value, Renderer};
pub use result::{DiffResult, Node, PathStep, ValueType};

/// Comparison options
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Keys present only on the right-hand side are ignored, at any depth
    pub ignore_adding_map_keys: bool,

    /// Missing and empty (null, zero, empty string, empty map/sequence) compare equal
    pub equate_empty: bool,

    /// `1.5` and `"1.5"` compare equal
    pub compare_number_and_numeric_string: bool,

    /// Path prefixes (dotted) excluded from the comparison
    pub ignored_paths: Vec<String>,
}

impl Options {
    pub fn with_ignore_adding_map_keys(mut self) -> Self {
        self.ignore_adding_map_keys = true;
        self
    }

    pub fn with_equate_empty(mut self) -> Self {
        self.equate_empty = true;
        self
    }

    pub fn with_compare_number_and_numeric_string(mut self) -> Self {
        self.compare_number_and_numeric_string = true;
        self
    }

    pub fn with_ignored_paths(mut self, paths: Vec<String>) -> Self {
        self.ignored_paths = paths;
        self
    }

    /// Options used when comparing Git-declared state against live state
    pub fn live_state() -> Self {
        Self::default()
            .with_equate_empty()
            .with_ignore_adding_map_keys()
            .with_compare_number_and_numeric_string()
    }
}

/// Compare `x` (old / declared) against `y` (new / live).
pub fn diff(x: &Value, y: &Value, options: &Options) -> DiffResult {
    let mut differ = Differ {
        options,
        result: DiffResult::default(),
    };
    differ.diff(Vec::new(), Some(x), Some(y));
    differ.result.sort();
    differ.result
}

/// Compare two YAML values.
pub fn diff_yaml(
    x: &serde_yaml::Value,
    y: &serde_yaml::Value,
    options: &Options,
) -> Result<DiffResult, crate::errors::PipedError> {
    let vx: Value = serde_yaml::from_value(x.clone())?;
    let vy: Value = serde_yaml::from_value(y.clone())?;
    Ok(diff(&vx, &vy, options))
}

struct Differ<'a> {
    options: &'a Options,
    result: DiffResult,
}

impl Differ<'_> {
    fn diff(&mut self, path: Vec<PathStep>, x: Option<&Value>, y: Option<&Value>) {
        if self.is_ignored(&path) {
            return;
        }

        let (vx, vy) = match (x, y) {
            (None, None) => return,
            (None, Some(vy)) => {
                if !(self.options.equate_empty && is_empty(vy)) {
                    self.result.add_node(path, None, Some(vy.clone()));
                }
                return;
            }
            (Some(vx), None) => {
                if !(self.options.equate_empty && is_empty(vx)) {
                    self.result.add_node(path, Some(vx.clone()), None);
                }
                return;
            }
            (Some(vx), Some(vy)) => (vx, vy),
        };

        if is_empty(vx) && is_empty(vy) {
            return;
        }

        if let (Some(nx), Some(ny)) = (as_number(vx), as_number(vy)) {
            self.diff_number(path, vx, vy, nx, ny);
            return;
        }

        if self.options.compare_number_and_numeric_string {
            if let (Some(nx), Some(ny)) = (as_number(vx), parse_numeric(vy)) {
                self.diff_number(path, vx, vy, nx, ny);
                return;
            }
            if let (Some(nx), Some(ny)) = (parse_numeric(vx), as_number(vy)) {
                self.diff_number(path, vx, vy, nx, ny);
                return;
            }
        }

        if ValueType::of(vx) != ValueType::of(vy) {
            self.result.add_node(path, Some(vx.clone()), Some(vy.clone()));
            return;
        }

        match (vx, vy) {
            (Value::Object(mx), Value::Object(my)) => self.diff_map(path, mx, my),
            (Value::Array(sx), Value::Array(sy)) => self.diff_slice(path, sx, sy),
            _ => {
                if vx != vy {
                    self.result.add_node(path, Some(vx.clone()), Some(vy.clone()));
                }
            }
        }
    }

    fn diff_number(&mut self, path: Vec<PathStep>, vx: &Value, vy: &Value, nx: f64, ny: f64) {
        if nx != ny {
            self.result.add_node(path, Some(vx.clone()), Some(vy.clone()));
        }
    }

    fn diff_map(&mut self, path: Vec<PathStep>, mx: &Map<String, Value>, my: &Map<String, Value>) {
        for (k, vx) in mx {
            let next = with_step(&path, PathStep::Key(k.clone()));
            self.diff(next, Some(vx), my.get(k));
        }
        if self.options.ignore_adding_map_keys {
            return;
        }
        for (k, vy) in my {
            if mx.contains_key(k) {
                continue;
            }
            let next = with_step(&path, PathStep::Key(k.clone()));
            self.diff(next, None, Some(vy));
        }
    }

    fn diff_slice(&mut self, path: Vec<PathStep>, sx: &[Value], sy: &[Value]) {
        let min_len = sx.len().min(sy.len());
        for i in 0..min_len {
            let next = with_step(&path, PathStep::Index(i));
            self.diff(next, Some(&sx[i]), Some(&sy[i]));
        }
        for (i, vx) in sx.iter().enumerate().skip(min_len) {
            let next = with_step(&path, PathStep::Index(i));
            if self.is_ignored(&next) {
                continue;
            }
            self.result.add_node(next, Some(vx.clone()), None);
        }
        for (i, vy) in sy.iter().enumerate().skip(min_len) {
            let next = with_step(&path, PathStep::Index(i));
            if self.is_ignored(&next) {
                continue;
            }
            self.result.add_node(next, None, Some(vy.clone()));
        }
    }

    fn is_ignored(&self, path: &[PathStep]) -> bool {
        if self.options.ignored_paths.is_empty() || path.is_empty() {
            return false;
        }
        let path_string = result::make_path_string(path);
        self.options
            .ignored_paths
            .iter()
            .any(|prefix| path_string.starts_with(prefix.as_str()))
    }
}

fn with_step(path: &[PathStep], step: PathStep) -> Vec<PathStep> {
    let mut next = Vec::with_capacity(path.len() + 1);
    next.extend_from_slice(path);
    next.push(step);
    next
}

/// Null, zero values and empty collections
fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
