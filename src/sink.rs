//! Result sinks for the final merged state.
//!
//! The executor hands back a [`PipelineState`]; a [`ResultSink`] decides
//! where it goes. [`JsonFileSink`] writes the state as pretty JSON with
//! bulky keys filtered out, [`MemorySink`] keeps it for inspection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::state::{PipelineState, StateMap};

/// Consumer of a finished run.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, state: &PipelineState) -> Result<()>;
}

/// Writes the state to a file as pretty-printed JSON.
///
/// Keys listed in `skip_keys` are removed at every nesting level before
/// writing.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
    skip_keys: HashSet<String>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            skip_keys: HashSet::new(),
        }
    }

    pub fn skip_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The JSON value that [`deliver`](ResultSink::deliver) writes.
    pub fn render(&self, state: &PipelineState) -> Value {
        strip_keys(state.to_value(), &self.skip_keys)
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn deliver(&self, state: &PipelineState) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.render(state))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, &body).await?;
        info!(path = %self.path.display(), bytes = body.len(), "results written");
        Ok(())
    }
}

/// Keeps every delivered state in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<StateMap>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent delivery.
    pub fn last(&self) -> Option<StateMap> {
        self.delivered.lock().ok().and_then(|d| d.last().cloned())
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn deliver(&self, state: &PipelineState) -> Result<()> {
        self.delivered
            .lock()
            .map_err(|_| PipelineError::Other("memory sink lock poisoned".into()))?
            .push(state.values().clone());
        Ok(())
    }
}

/// Lift the entries of every top-level object into one map.
///
/// `{"a": {"x": 1}, "b": {"y": 2}, "c": 3}` becomes `{"x": 1, "y": 2}`.
/// Non-object values are dropped and later keys win on collision.
pub fn flatten_outputs(values: &StateMap) -> StateMap {
    let mut flat = Map::new();
    for value in values.values() {
        if let Value::Object(inner) = value {
            for (k, v) in inner {
                flat.insert(k.clone(), v.clone());
            }
        }
    }
    flat
}

fn strip_keys(value: Value, skip: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !skip.contains(k))
                .map(|(k, v)| (k, strip_keys(v, skip)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| strip_keys(v, skip)).collect()),
        other => other,
    }
}
