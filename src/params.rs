//! Nested configuration trees for task modules.
//!
//! Every task exposes its tunable state as a tree of typed leaves. Scenario
//! lines address leaves with dash-separated paths (`feedbacks-positive-duration`)
//! and carry raw string values; the tree coerces a raw value to the type of
//! the leaf it replaces, so a leaf never changes type over the life of a run.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
    Tree(ParamTree),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "string",
            ParamValue::List(_) => "list",
            ParamValue::Tree(_) => "table",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(value) => Some(*value),
            ParamValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            _ => None,
        }
    }

    fn from_json(value: serde_json::Value) -> Option<ParamValue> {
        match value {
            serde_json::Value::Bool(b) => Some(ParamValue::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ParamValue::Int(i))
                } else {
                    n.as_f64().map(ParamValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(ParamValue::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(ParamValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ParamValue::List),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
            ParamValue::Text(value) => write!(f, "{value}"),
            ParamValue::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ParamValue::Tree(_) => write!(f, "<table>"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter '{path}'")]
    UnknownPath { path: String },
    #[error("parameter '{path}' is a nested table, not a value")]
    NotALeaf { path: String },
    #[error("cannot coerce '{raw}' to {expected} for parameter '{path}'")]
    Coercion {
        path: String,
        raw: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamTree {
    entries: BTreeMap<String, ParamValue>,
}

impl ParamTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used when declaring a task's defaults.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub fn get_path(&self, path: &[String]) -> Option<&ParamValue> {
        let (first, rest) = path.split_first()?;
        let value = self.entries.get(first)?;
        if rest.is_empty() {
            Some(value)
        } else {
            match value {
                ParamValue::Tree(tree) => tree.get_path(rest),
                _ => None,
            }
        }
    }

    pub fn set_path(&mut self, path: &[String], value: ParamValue) -> Result<(), ParamError> {
        let joined = path.join("-");
        let Some((first, rest)) = path.split_first() else {
            return Err(ParamError::UnknownPath { path: joined });
        };
        let Some(slot) = self.entries.get_mut(first) else {
            return Err(ParamError::UnknownPath { path: joined });
        };
        if rest.is_empty() {
            if matches!(slot, ParamValue::Tree(_)) {
                return Err(ParamError::NotALeaf { path: joined });
            }
            *slot = value;
            Ok(())
        } else {
            match slot {
                ParamValue::Tree(tree) => tree.set_path(rest, value),
                _ => Err(ParamError::UnknownPath { path: joined }),
            }
        }
    }

    /// Coerce a raw scenario value to the type of the leaf at `path`.
    ///
    /// Bools accept case-insensitive `true`/`false`; ints and floats are
    /// parsed numerically; strings pass through verbatim; list leaves fall
    /// back to a generic JSON-literal parse.
    pub fn coerce_path(&self, path: &[String], raw: &str) -> Result<ParamValue, ParamError> {
        let joined = path.join("-");
        let current = self
            .get_path(path)
            .ok_or_else(|| ParamError::UnknownPath {
                path: joined.clone(),
            })?;
        let mismatch = |expected: &'static str| ParamError::Coercion {
            path: joined.clone(),
            raw: raw.to_string(),
            expected,
        };
        match current {
            ParamValue::Bool(_) => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(ParamValue::Bool(true)),
                "false" => Ok(ParamValue::Bool(false)),
                _ => Err(mismatch("bool")),
            },
            ParamValue::Int(_) => raw
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| mismatch("int")),
            ParamValue::Float(_) => raw
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| mismatch("float")),
            ParamValue::Text(_) => Ok(ParamValue::Text(raw.to_string())),
            ParamValue::List(_) => serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(ParamValue::from_json)
                .ok_or_else(|| mismatch("list")),
            ParamValue::Tree(_) => Err(ParamError::NotALeaf { path: joined }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamTree {
        ParamTree::new()
            .with("taskupdatetime", 200i64)
            .with("scalestyle", 2i64)
            .with("cutofffrequency", 0.06f64)
            .with("automaticsolver", false)
            .with("title", "Tracking")
            .with("levels", ParamValue::List(vec![ParamValue::Int(1), ParamValue::Int(2)]))
            .with(
                "feedbacks",
                ParamValue::Tree(ParamTree::new().with(
                    "positive",
                    ParamValue::Tree(ParamTree::new().with("duration", 1500i64)),
                )),
            )
    }

    fn path(spec: &str) -> Vec<String> {
        spec.split('-').map(str::to_string).collect()
    }

    #[test]
    fn coerces_to_existing_leaf_types() {
        let tree = sample();
        assert_eq!(
            tree.coerce_path(&path("scalestyle"), "2").unwrap(),
            ParamValue::Int(2)
        );
        assert_eq!(
            tree.coerce_path(&path("cutofffrequency"), "0.12").unwrap(),
            ParamValue::Float(0.12)
        );
        assert_eq!(
            tree.coerce_path(&path("automaticsolver"), "TRUE").unwrap(),
            ParamValue::Bool(true)
        );
        assert_eq!(
            tree.coerce_path(&path("title"), "42").unwrap(),
            ParamValue::Text("42".into())
        );
    }

    #[test]
    fn coerces_list_leaves_via_literal_parse() {
        let tree = sample();
        assert_eq!(
            tree.coerce_path(&path("levels"), "[3,4,5]").unwrap(),
            ParamValue::List(vec![
                ParamValue::Int(3),
                ParamValue::Int(4),
                ParamValue::Int(5)
            ])
        );
    }

    #[test]
    fn nested_paths_resolve_and_update() {
        let mut tree = sample();
        let p = path("feedbacks-positive-duration");
        assert_eq!(tree.get_path(&p), Some(&ParamValue::Int(1500)));
        tree.set_path(&p, ParamValue::Int(900)).unwrap();
        assert_eq!(tree.get_path(&p), Some(&ParamValue::Int(900)));
    }

    #[test]
    fn unknown_paths_and_bad_values_are_errors() {
        let tree = sample();
        assert!(matches!(
            tree.coerce_path(&path("nosuchkey"), "1"),
            Err(ParamError::UnknownPath { .. })
        ));
        assert!(matches!(
            tree.coerce_path(&path("scalestyle"), "fast"),
            Err(ParamError::Coercion { .. })
        ));
        assert!(matches!(
            tree.coerce_path(&path("automaticsolver"), "yes"),
            Err(ParamError::Coercion { .. })
        ));
        assert!(matches!(
            tree.coerce_path(&path("feedbacks"), "1"),
            Err(ParamError::NotALeaf { .. })
        ));
    }
}
