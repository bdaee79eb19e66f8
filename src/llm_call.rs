//! State-driven prompt node.
//!
//! [`LlmCall`] reads named keys from the state snapshot, renders them into
//! a prompt template, runs one exchange with the service and writes the
//! reply under its output key. It is the building block for checklist and
//! validation steps that work on earlier nodes' results rather than on the
//! raw documents.

use crate::{
    client::{exchange, ExchangeRequest, LlmConfig},
    error::{PipelineError, Result},
    exec_ctx::ExecCtx,
    node::{BoxFut, TaskNode},
    parsing::parse_json_like,
    prompt::render,
    state::{PipelineState, StateMap},
    tools::CapabilityRegistry,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A prompt node over state keys.
///
/// Each input key is available in the template as `{key}`, and all of them
/// together as `{input}` (a JSON object). String values are inserted as
/// they are, everything else as pretty-printed JSON. Context variables from
/// [`ExecCtx::vars`] fill any remaining placeholders.
///
/// A missing input, a failed exchange or an unparseable reply (with
/// [`expecting_json`](LlmCall::expecting_json)) fails the node. The
/// executor then records the error entry under the node's name and does
/// not route from it.
///
/// # Example
///
/// ```
/// use llm_docflow::LlmCall;
///
/// let validate = LlmCall::new("Validate PO data", "Check this purchase order: {parsed_data}")
///     .with_inputs(["parsed_data"])
///     .with_output_key("validation_result")
///     .expecting_json();
/// ```
pub struct LlmCall {
    name: String,
    prompt_template: String,
    inputs: Vec<String>,
    output_key: String,
    model: Option<String>,
    config: Option<LlmConfig>,
    capabilities: Option<CapabilityRegistry>,
    expect_json: bool,
}

impl LlmCall {
    /// A node writing its reply text under its own name.
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            output_key: name.clone(),
            name,
            prompt_template: prompt_template.into(),
            inputs: Vec::new(),
            model: None,
            config: None,
            capabilities: None,
            expect_json: false,
        }
    }

    pub fn prompt_template(&self) -> &str {
        &self.prompt_template
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// State keys the template reads. All must be present when the node runs.
    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Some(registry);
        self
    }

    /// Parse the reply with [`parse_json_like`] instead of storing raw text.
    pub fn expecting_json(mut self) -> Self {
        self.expect_json = true;
        self
    }

    /// Render the prompt for `state`, or name the first missing input key.
    pub fn render_prompt(&self, state: &PipelineState, vars: &HashMap<String, String>) -> std::result::Result<String, String> {
        let mut values = vars.clone();
        let mut input = serde_json::Map::new();
        for key in &self.inputs {
            let value = state.get(key).ok_or_else(|| key.clone())?;
            values.insert(key.clone(), display_value(value));
            input.insert(key.clone(), value.clone());
        }
        values.insert("input".into(), display_value(&Value::Object(input)));
        Ok(render(&self.prompt_template, &values))
    }

    async fn run(&self, ctx: &ExecCtx, state: &PipelineState) -> Result<Value> {
        let prompt = self.render_prompt(state, &ctx.vars).map_err(|missing| {
            warn!(node = %self.name, key = %missing, "input key missing");
            PipelineError::MissingInput(missing)
        })?;

        let mut request = ExchangeRequest::new(self.name.clone(), prompt);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        if let Some(config) = &self.config {
            request = request.with_config(config.clone());
        }

        let outcome = exchange(ctx, &request, self.capabilities.as_ref())
            .await
            .inspect_err(|e| {
                if !e.is_cancelled() {
                    warn!(node = %self.name, error = %e, "exchange failed");
                }
            })?;
        debug!(node = %self.name, tool_rounds = outcome.tool_rounds, usage = ?outcome.usage, "exchange finished");

        if !self.expect_json {
            return Ok(Value::String(outcome.text));
        }
        parse_json_like(&outcome.text)
    }
}

impl TaskNode for LlmCall {
    fn kind(&self) -> &'static str {
        "llm-call"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, ctx: &'a ExecCtx, state: Arc<PipelineState>) -> BoxFut<'a, Result<StateMap>> {
        Box::pin(async move {
            let value = self.run(ctx, &state).await?;
            let mut update = StateMap::new();
            update.insert(self.output_key.clone(), value);
            Ok(update)
        })
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContentBlock, LlmResponse, MockBackend, MockReply, ToolOutput, ToolSpec};
    use crate::retry::BackoffConfig;
    use crate::tools::FnCapability;
    use serde_json::json;

    fn state() -> Arc<PipelineState> {
        let values = json!({
            "parsed_data": {"po.pdf": {"result": {"po_number": "4500"}}},
            "po_check": "Yes",
        });
        Arc::new(PipelineState::from_values(values.as_object().cloned().unwrap()))
    }

    fn ctx(backend: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://mock")
            .backend(backend)
            .backoff(BackoffConfig::none())
            .var("company", "Acme")
            .build()
    }

    fn prompt_of(backend: &MockBackend) -> String {
        match &backend.requests()[0].turns[0].content[0] {
            ContentBlock::Text(text) => text.clone(),
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renders_inputs_and_parses_json() {
        let backend = Arc::new(MockBackend::fixed("Result:\n{\"valid\": true}"));
        let node = LlmCall::new("Validate PO data", "For {company}: {po_check} / {parsed_data}")
            .with_inputs(["parsed_data", "po_check"])
            .with_output_key("validation_result")
            .expecting_json();

        let update = node.execute(&ctx(backend.clone()), state()).await.unwrap();
        assert_eq!(update["validation_result"], json!({"valid": true}));

        let prompt = prompt_of(&backend);
        assert!(prompt.starts_with("For Acme: Yes / {"));
        assert!(prompt.contains("\"po_number\": \"4500\""));
    }

    #[tokio::test]
    async fn test_input_placeholder_holds_all_inputs() {
        let backend = Arc::new(MockBackend::fixed("done"));
        let node = LlmCall::new("Checklist", "Review {input}").with_inputs(["po_check"]);
        let update = node.execute(&ctx(backend.clone()), state()).await.unwrap();
        assert_eq!(update["Checklist"], "done");
        assert!(prompt_of(&backend).contains("\"po_check\": \"Yes\""));
    }

    #[tokio::test]
    async fn test_missing_input_skips_service() {
        let backend = Arc::new(MockBackend::fixed("unused"));
        let node = LlmCall::new("Checklist", "{union_data}").with_inputs(["union_data"]);
        let err = node.execute(&ctx(backend.clone()), state()).await.unwrap_err();
        assert_eq!(err.kind(), "missing_input");
        assert!(err.to_string().contains("union_data"));
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_service_error_fails_node() {
        let backend = Arc::new(MockBackend::scripted(vec![MockReply::Fail("down".into())]));
        let node = LlmCall::new("Checklist", "check").with_output_key("checklist");
        let err = node.execute(&ctx(backend), state()).await.unwrap_err();
        assert_eq!(err.kind(), "http");
    }

    #[tokio::test]
    async fn test_unparseable_reply_fails_node() {
        let backend = Arc::new(MockBackend::fixed("no structure here"));
        let node = LlmCall::new("Validate PO data", "check").expecting_json();
        let err = node.execute(&ctx(backend), state()).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert_eq!(err.raw(), Some("no structure here"));
    }

    #[tokio::test]
    async fn test_cancelled_propagates() {
        let backend = Arc::new(MockBackend::fixed("unused"));
        let ctx = ctx(backend);
        ctx.cancellation.cancel();
        let err = LlmCall::new("Checklist", "check").execute(&ctx, state()).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_uses_capabilities() {
        let backend = Arc::new(MockBackend::scripted(vec![
            MockReply::Respond(LlmResponse::from_tool_use("t1", "lookup_vendor", json!({"po_number": "4500"}))),
            MockReply::text("{\"vendor\": \"Acme\"}"),
        ]));
        let registry = CapabilityRegistry::new().with(FnCapability::new(
            ToolSpec::new("lookup_vendor", "Find the vendor for a PO", json!({"type": "object"})),
            |_input| Ok(ToolOutput::Json(json!({"vendor": "Acme"}))),
        ));
        let node = LlmCall::new("Vendor", "Who sold {po_check}?")
            .with_inputs(["po_check"])
            .with_capabilities(registry)
            .expecting_json();
        let update = node.execute(&ctx(backend.clone()), state()).await.unwrap();
        assert_eq!(update["Vendor"]["vendor"], "Acme");
        assert_eq!(backend.request_count(), 2);
    }
}
