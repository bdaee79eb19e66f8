//! Local capability registry for the tool-invocation protocol.
//!
//! When the service answers with a tool invocation, the client resolves the
//! name here, runs the capability with the structured input, and sends the
//! output back as a tool-result turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::backend::{ToolInvocation, ToolOutput, ToolSpec};
use crate::error::{PipelineError, Result};
use crate::node::BoxFut;

/// A locally executable capability offered to the model.
pub trait Capability: Send + Sync {
    /// Declaration sent to the service.
    fn spec(&self) -> &ToolSpec;

    /// Run with the model-supplied input.
    fn invoke<'a>(&'a self, input: Value) -> BoxFut<'a, Result<ToolOutput>>;
}

type CapabilityFn = dyn Fn(Value) -> anyhow::Result<ToolOutput> + Send + Sync;

/// A [`Capability`] backed by a synchronous closure.
///
/// # Example
///
/// ```
/// use llm_docflow::backend::{ToolOutput, ToolSpec};
/// use llm_docflow::tools::FnCapability;
/// use serde_json::json;
///
/// let upper = FnCapability::new(
///     ToolSpec::new("upper", "Uppercase a string", json!({"type": "object"})),
///     |input| Ok(ToolOutput::Text(input["text"].as_str().unwrap_or("").to_uppercase())),
/// );
/// ```
pub struct FnCapability {
    spec: ToolSpec,
    f: Box<CapabilityFn>,
}

impl FnCapability {
    pub fn new<F>(spec: ToolSpec, f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<ToolOutput> + Send + Sync + 'static,
    {
        Self {
            spec,
            f: Box::new(f),
        }
    }
}

impl Capability for FnCapability {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn invoke<'a>(&'a self, input: Value) -> BoxFut<'a, Result<ToolOutput>> {
        Box::pin(async move {
            (self.f)(input).map_err(|e| PipelineError::Capability {
                name: self.spec.name.clone(),
                message: e.to_string(),
            })
        })
    }
}

/// Static name-to-capability map.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a capability under its spec name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.entries
            .insert(capability.spec().name.clone(), capability);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.register(Arc::new(capability));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declarations for every registered capability, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.values().map(|c| c.spec().clone()).collect()
    }

    /// A registry restricted to `names`. Naming an unregistered capability
    /// is a configuration error.
    pub fn select(&self, names: &[&str]) -> Result<Self> {
        let mut selected = Self::new();
        for name in names {
            let cap = self.entries.get(*name).ok_or_else(|| {
                PipelineError::InvalidConfig(format!("no capability registered as '{name}'"))
            })?;
            selected.entries.insert((*name).to_string(), cap.clone());
        }
        Ok(selected)
    }

    /// Resolve and run an invocation. Unknown names are a protocol error.
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let cap = self.entries.get(&invocation.name).ok_or_else(|| {
            PipelineError::Protocol(format!(
                "service requested unknown tool '{}'",
                invocation.name
            ))
        })?;
        debug!(tool = %invocation.name, id = %invocation.id, "dispatching capability");
        cap.invoke(invocation.input.clone()).await
    }
}
