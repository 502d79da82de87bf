//! Worker-side variable store and the `eval` expression surface.
//!
//! Three expression forms are supported, enough to park state on a worker
//! between calls:
//!
//! - `path.to.var = <json>` — assignment; intermediate namespaces are
//!   created as objects on demand
//! - `path.to.var` — lookup
//! - `<json>` — a bare JSON literal, evaluating to itself

use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::protocol::RemoteError;

/// Process-wide variable store, rooted at an object.
#[derive(Default)]
pub struct EvalEnv {
    root: Mutex<Map<String, Value>>,
}

impl EvalEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one expression.
    pub fn eval(&self, expr: &str) -> Result<Value, RemoteError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(RemoteError::new(RemoteError::EVAL, "empty expression"));
        }

        if let Some((path, literal)) = split_assignment(expr) {
            let value: Value = serde_json::from_str(literal).map_err(|e| {
                RemoteError::new(
                    RemoteError::EVAL,
                    format!("right-hand side is not a JSON literal: {}", e),
                )
            })?;
            self.assign(&path, value)?;
            return Ok(Value::Null);
        }

        if let Some(path) = parse_path(expr) {
            return self.lookup(&path);
        }

        serde_json::from_str(expr).map_err(|_| {
            RemoteError::new(
                RemoteError::EVAL,
                format!("cannot evaluate expression: {:?}", expr),
            )
        })
    }

    fn assign(&self, path: &[String], value: Value) -> Result<(), RemoteError> {
        let mut root = self.root.lock().expect("eval env poisoned");
        let mut current = &mut *root;
        for segment in &path[..path.len() - 1] {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry.as_object_mut().ok_or_else(|| {
                RemoteError::new(
                    RemoteError::EVAL,
                    format!("{:?} is not a namespace", segment),
                )
            })?;
        }
        current.insert(path[path.len() - 1].clone(), value);
        Ok(())
    }

    fn lookup(&self, path: &[String]) -> Result<Value, RemoteError> {
        let root = self.root.lock().expect("eval env poisoned");
        let mut current: &Value = root.get(&path[0]).ok_or_else(|| undefined(&path[0]))?;
        for segment in &path[1..] {
            current = current
                .as_object()
                .and_then(|obj| obj.get(segment))
                .ok_or_else(|| undefined(segment))?;
        }
        Ok(current.clone())
    }
}

fn undefined(name: &str) -> RemoteError {
    RemoteError::new(
        RemoteError::UNDEFINED_VARIABLE,
        format!("undefined variable {:?}", name),
    )
}

/// Split `path = literal` if the left-hand side is a bare path and the `=` is
/// not part of `==`. Anything else falls through to lookup/literal handling.
fn split_assignment(expr: &str) -> Option<(Vec<String>, &str)> {
    let pos = expr.find('=')?;
    if expr[pos + 1..].starts_with('=') {
        return None;
    }
    let path = parse_path(expr[..pos].trim())?;
    Some((path, expr[pos + 1..].trim()))
}

/// Parse a dotted identifier path; `None` if any segment is not a bare
/// identifier.
fn parse_path(expr: &str) -> Option<Vec<String>> {
    if expr.is_empty() {
        return None;
    }
    let segments: Vec<&str> = expr.split('.').collect();
    for segment in &segments {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return None,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
    }
    Some(segments.into_iter().map(String::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assign_then_lookup() {
        let env = EvalEnv::new();
        assert_eq!(env.eval("sandbox.x = \"hi\"").unwrap(), Value::Null);
        assert_eq!(env.eval("sandbox.x").unwrap(), json!("hi"));
    }

    #[test]
    fn test_nested_namespaces_created_on_demand() {
        let env = EvalEnv::new();
        env.eval("a.b.c = [1, 2, 3]").unwrap();
        assert_eq!(env.eval("a.b.c").unwrap(), json!([1, 2, 3]));
        assert_eq!(env.eval("a.b").unwrap(), json!({"c": [1, 2, 3]}));
    }

    #[test]
    fn test_reassignment_overwrites() {
        let env = EvalEnv::new();
        env.eval("counter = 1").unwrap();
        env.eval("counter = 2").unwrap();
        assert_eq!(env.eval("counter").unwrap(), json!(2));
    }

    #[test]
    fn test_literal_evaluates_to_itself() {
        let env = EvalEnv::new();
        assert_eq!(env.eval("42").unwrap(), json!(42));
        assert_eq!(env.eval("{\"k\": true}").unwrap(), json!({"k": true}));
        assert_eq!(env.eval("\"plain\"").unwrap(), json!("plain"));
    }

    #[test]
    fn test_undefined_variable() {
        let env = EvalEnv::new();
        let err = env.eval("missing").unwrap_err();
        assert_eq!(err.kind, RemoteError::UNDEFINED_VARIABLE);
    }

    #[test]
    fn test_assign_into_non_namespace_fails() {
        let env = EvalEnv::new();
        env.eval("scalar = 5").unwrap();
        let err = env.eval("scalar.field = 1").unwrap_err();
        assert_eq!(err.kind, RemoteError::EVAL);
    }

    #[test]
    fn test_string_literal_containing_equals() {
        // The '=' inside a string literal must not be mistaken for assignment.
        let env = EvalEnv::new();
        assert_eq!(env.eval("\"a=b\"").unwrap(), json!("a=b"));
    }

    #[test]
    fn test_bad_expression() {
        let env = EvalEnv::new();
        assert!(env.eval("not valid at all!").is_err());
        assert!(env.eval("").is_err());
        assert!(env.eval("x = not-json").is_err());
    }
}
