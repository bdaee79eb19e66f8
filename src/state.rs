//! Pipeline state and deep-merge semantics.
//!
//! [`PipelineState`] is the one mutable resource of a run. The executor
//! owns it and is the only writer; nodes see an `Arc` snapshot and return
//! partial updates, which are folded in with [`deep_merge`].

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::document::Document;
use crate::error::PipelineError;

/// A JSON object used for state and node updates.
pub type StateMap = Map<String, Value>;

/// Key under which the uploaded-document manifest is seeded.
pub const UPLOADED_FILES_KEY: &str = "uploaded_files";

/// Shared state of one run: the read-only document set plus merged values.
#[derive(Debug, Clone)]
pub struct PipelineState {
    documents: Arc<[Document]>,
    values: StateMap,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::from_values(StateMap::new())
    }
}

impl PipelineState {
    /// Start a run over `documents`, seeding an `uploaded_files` manifest of
    /// `{name, format, size}` entries.
    pub fn new(documents: Vec<Document>) -> Self {
        let manifest: Vec<Value> = documents
            .iter()
            .map(|d| json!({"name": d.name(), "format": d.kind().format_tag(), "size": d.size()}))
            .collect();
        let mut values = StateMap::new();
        values.insert(UPLOADED_FILES_KEY.to_string(), Value::Array(manifest));
        Self {
            documents: documents.into(),
            values,
        }
    }

    /// State with no documents and the given values.
    pub fn from_values(values: StateMap) -> Self {
        Self {
            documents: Arc::from(Vec::new()),
            values,
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn values(&self) -> &StateMap {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A top-level string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Deep-merge `update` and return the dotted keys whose value changed.
    pub fn merge(&mut self, update: StateMap) -> Vec<String> {
        deep_merge(&mut self.values, update)
    }

    /// The merged values as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn into_values(self) -> StateMap {
        self.values
    }
}

/// Recursively merge `update` into `target`.
///
/// Where both sides hold an object the merge recurses; otherwise the update
/// value overwrites. Returns the dotted paths of leaves that changed
/// (a path is reported at the level where the overwrite happened).
///
/// ```
/// use llm_docflow::state::{deep_merge, StateMap};
/// use serde_json::json;
///
/// let mut state = StateMap::new();
/// deep_merge(&mut state, json!({"a": {"x": 1}}).as_object().unwrap().clone());
/// let changed = deep_merge(&mut state, json!({"a": {"y": 2}}).as_object().unwrap().clone());
/// assert_eq!(serde_json::Value::Object(state), json!({"a": {"x": 1, "y": 2}}));
/// assert_eq!(changed, vec!["a.y"]);
/// ```
pub fn deep_merge(target: &mut StateMap, update: StateMap) -> Vec<String> {
    let mut changed = Vec::new();
    merge_into(target, update, "", &mut changed);
    changed
}

fn merge_into(target: &mut StateMap, update: StateMap, prefix: &str, changed: &mut Vec<String>) {
    for (key, value) in update {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if !target.contains_key(&key) {
            target.insert(key, value);
            changed.push(path);
            continue;
        }
        let Some(existing) = target.get_mut(&key) else {
            continue;
        };
        match (existing, value) {
            (Value::Object(dst), Value::Object(incoming)) => {
                merge_into(dst, incoming, &path, changed);
            }
            (existing, value) => {
                if *existing != value {
                    *existing = value;
                    changed.push(path);
                }
            }
        }
    }
}

/// Error wrapper merged into state in place of a result:
/// `{error, error_kind, result: null, raw?}`.
pub fn error_entry(err: &PipelineError) -> Value {
    error_entry_with(err.kind(), &err.to_string(), err.raw())
}

/// Build an error entry from its parts.
pub fn error_entry_with(kind: &str, message: &str, raw: Option<&str>) -> Value {
    let mut entry = json!({
        "error": message,
        "error_kind": kind,
        "result": Value::Null,
    });
    if let Some(raw) = raw {
        entry["raw"] = Value::String(raw.to_string());
    }
    entry
}

/// Whether a value is an error entry produced by [`error_entry`].
pub fn is_error_entry(value: &Value) -> bool {
    value.get("error").is_some() && value.get("result").is_some_and(Value::is_null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(v: Value) -> StateMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_nested_maps_union() {
        let mut state = StateMap::new();
        deep_merge(&mut state, obj(json!({"a": {"x": 1}})));
        deep_merge(&mut state, obj(json!({"a": {"y": 2}})));
        assert_eq!(Value::Object(state), json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_scalar_overwrite_reports_key() {
        let mut state = StateMap::new();
        deep_merge(&mut state, obj(json!({"a": 1})));
        let changed = deep_merge(&mut state, obj(json!({"a": 2})));
        assert_eq!(Value::Object(state), json!({"a": 2}));
        assert_eq!(changed, vec!["a"]);
    }

    #[test]
    fn test_unchanged_value_not_reported() {
        let mut state = obj(json!({"a": {"x": 1}}));
        let changed = deep_merge(&mut state, obj(json!({"a": {"x": 1}})));
        assert!(changed.is_empty());
    }

    #[test]
    fn test_object_replaces_scalar() {
        let mut state = obj(json!({"a": 1}));
        let changed = deep_merge(&mut state, obj(json!({"a": {"b": true}})));
        assert_eq!(Value::Object(state), json!({"a": {"b": true}}));
        assert_eq!(changed, vec!["a"]);
    }

    #[test]
    fn test_disjoint_updates_commute() {
        let u1 = obj(json!({"checklist": {"ok": true}}));
        let u2 = obj(json!({"po_check": "Yes"}));

        let mut a = StateMap::new();
        deep_merge(&mut a, u1.clone());
        deep_merge(&mut a, u2.clone());

        let mut b = StateMap::new();
        deep_merge(&mut b, u2);
        deep_merge(&mut b, u1);

        assert_eq!(a, b);
    }

    #[test]
    fn test_new_state_seeds_manifest() {
        let state = PipelineState::new(vec![Document::new("po.pdf", vec![0u8; 4])]);
        assert_eq!(
            state.get(UPLOADED_FILES_KEY),
            Some(&json!([{"name": "po.pdf", "format": "pdf", "size": 4}]))
        );
        assert_eq!(state.documents().len(), 1);
    }

    #[test]
    fn test_error_entry_shape() {
        let err = PipelineError::Parse {
            message: "no JSON".into(),
            raw: "hello".into(),
        };
        let entry = error_entry(&err);
        assert_eq!(entry["error_kind"], "parse");
        assert_eq!(entry["raw"], "hello");
        assert!(entry["result"].is_null());
        assert!(is_error_entry(&entry));
        assert!(!is_error_entry(&json!({"result": {"doc_type": "PO"}})));
    }
}
