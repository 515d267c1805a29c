use std::fmt;

use serde_json::Value;

use crate::errors::PipedError;
use crate::regexpool;

/// One step of the path to a difference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

impl PathStep {
    pub fn is_index(&self) -> bool {
        matches!(self, PathStep::Index(_))
    }
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Key(k) => f.write_str(k),
            PathStep::Index(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn of(v: &Value) -> Self {
        match v {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }
}

/// A single difference. `None` on one side means the value is absent there.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: Vec<PathStep>,
    pub path_string: String,
    pub type_x: Option<ValueType>,
    pub type_y: Option<ValueType>,
    pub value_x: Option<Value>,
    pub value_y: Option<Value>,
}

impl Node {
    /// Scalar left-hand value as a display string, empty when absent
    pub fn string_x(&self) -> String {
        scalar_string(self.value_x.as_ref())
    }

    pub fn string_y(&self) -> String {
        scalar_string(self.value_y.as_ref())
    }
}

fn scalar_string(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => super::renderer::render_node_value(Some(other), "").0,
    }
}

/// Ordered list of differences, sorted by path string
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    nodes: Vec<Node>,
}

impl DiffResult {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn num(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_diff(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn no_change(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First node whose path string matches `query`
    pub fn find(&self, query: &str) -> Result<Option<&Node>, PipedError> {
        let re = regexpool::default_pool().get(query)?;
        Ok(self.nodes.iter().find(|n| re.is_match(&n.path_string)))
    }

    pub fn find_all(&self, query: &str) -> Result<Vec<&Node>, PipedError> {
        let re = regexpool::default_pool().get(query)?;
        Ok(self
            .nodes
            .iter()
            .filter(|n| re.is_match(&n.path_string))
            .collect())
    }

    pub fn find_by_prefix(&self, prefix: &str) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.path_string.starts_with(prefix))
            .collect()
    }

    pub(super) fn add_node(&mut self, path: Vec<PathStep>, x: Option<Value>, y: Option<Value>) {
        self.nodes.push(Node {
            path_string: make_path_string(&path),
            path,
            type_x: x.as_ref().map(ValueType::of),
            type_y: y.as_ref().map(ValueType::of),
            value_x: x,
            value_y: y,
        });
    }

    pub(super) fn sort(&mut self) {
        self.nodes.sort_by(|a, b| a.path_string.cmp(&b.path_string));
    }
}

pub(super) fn make_path_string(path: &[PathStep]) -> String {
    path.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_string() {
        let path = vec![
            PathStep::Key("spec".to_string()),
            PathStep::Key("containers".to_string()),
            PathStep::Index(0),
            PathStep::Key("image".to_string()),
        ];
        assert_eq!(make_path_string(&path), "spec.containers.0.image");
    }

    #[test]
    fn test_find_by_prefix() {
        let mut result = DiffResult::default();
        result.add_node(
            vec![PathStep::Key("spec".into()), PathStep::Key("replicas".into())],
            Some(Value::from(2)),
            Some(Value::from(3)),
        );
        result.add_node(
            vec![PathStep::Key("metadata".into()), PathStep::Key("name".into())],
            Some(Value::from("a")),
            Some(Value::from("b")),
        );
        result.sort();
        assert_eq!(result.nodes()[0].path_string, "metadata.name");
        assert_eq!(result.find_by_prefix("spec").len(), 1);
        assert_eq!(result.find_all("^(spec|metadata)").unwrap().len(), 2);
        assert!(result.find("^status").unwrap().is_none());
        assert_eq!(result.nodes()[1].string_y(), "3");
    }
}
