//! Generative service client: one logical exchange, including tool rounds.
//!
//! [`exchange`] builds a single user turn from a prompt and its attachments,
//! sends it through the retry controller, and, when a capability registry is
//! supplied, resolves tool invocations locally and sends follow-up requests
//! until the service answers with text or the round cap is reached.

use crate::backend::{with_backoff, ContentBlock, LlmRequest, LlmResponse, StopReason, Turn, Usage};
use crate::document::Document;
use crate::error::Result;
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::tools::CapabilityRegistry;
use crate::PipelineError;
use std::time::Duration;
use tracing::{debug, info};

/// Generation parameters for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic).
    pub temperature: f64,

    /// Maximum tokens to generate. `None` leaves the provider default.
    pub max_tokens: Option<u32>,

    /// Nucleus sampling cutoff.
    pub top_p: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            top_p: None,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Input to one [`exchange`].
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// Label used in logs and events (node or document name).
    pub label: String,
    /// Prompt text, placed before the attachments.
    pub prompt: String,
    /// Documents embedded as binary blocks.
    pub attachments: Vec<Document>,
    /// Model override. `None` uses [`ExecCtx::default_model`].
    pub model_id: Option<String>,
    /// Generation override. `None` uses [`ExecCtx::llm_config`].
    pub config: Option<LlmConfig>,
}

impl ExchangeRequest {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            model_id: None,
            config: None,
        }
    }

    pub fn with_attachment(mut self, doc: Document) -> Self {
        self.attachments.push(doc);
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The opening user turn: prompt text, then one block per attachment.
    pub fn first_turn(&self) -> Turn {
        let mut content = Vec::with_capacity(self.attachments.len() + 1);
        if !self.prompt.is_empty() {
            content.push(ContentBlock::Text(self.prompt.clone()));
        }
        for doc in &self.attachments {
            let format = doc.kind().format_tag().to_string();
            let bytes = doc.bytes().clone();
            if doc.kind().is_image() {
                content.push(ContentBlock::Image { format, bytes });
            } else {
                content.push(ContentBlock::Document {
                    name: doc.attachment_name(),
                    format,
                    bytes,
                });
            }
        }
        Turn::user(content)
    }
}

/// Result of a completed exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// Text of the terminal response.
    pub text: String,
    pub stop_reason: StopReason,
    /// Usage summed over every request in the exchange.
    pub usage: Usage,
    /// Number of tool rounds performed.
    pub tool_rounds: u32,
    /// Number of requests sent (excluding throttling retries).
    pub requests: u32,
}

/// Run one logical exchange with the service.
///
/// Without `capabilities` the first response's text is the result. With
/// them, each response carrying tool invocations triggers one round: every
/// invocation is dispatched, the assistant turn and a single tool-result
/// turn are appended, and one follow-up request is sent. More than
/// `ctx.max_tool_rounds` rounds is a [`PipelineError::Protocol`] error, as
/// are unknown tool names and responses with neither text nor tool calls.
pub async fn exchange(
    ctx: &ExecCtx,
    request: &ExchangeRequest,
    capabilities: Option<&CapabilityRegistry>,
) -> Result<ExchangeOutcome> {
    ctx.check_cancelled()?;

    let model = request
        .model_id
        .clone()
        .unwrap_or_else(|| ctx.default_model.clone());
    let mut llm_request = LlmRequest {
        model,
        turns: vec![request.first_turn()],
        config: request.config.clone().unwrap_or_else(|| ctx.llm_config.clone()),
        tools: capabilities.map(|c| c.specs()).unwrap_or_default(),
    };

    let mut usage = Usage::default();
    let mut requests = 0u32;
    let mut rounds = 0u32;

    loop {
        let response = send(ctx, &request.label, &llm_request).await?;
        requests += 1;
        usage += response.usage;

        let registry = match capabilities {
            Some(registry) => registry,
            None => return finish(response, usage, rounds, requests),
        };
        let invocations = response.tool_invocations();
        if invocations.is_empty() {
            return finish(response, usage, rounds, requests);
        }

        rounds += 1;
        if rounds > ctx.max_tool_rounds {
            return Err(PipelineError::Protocol(format!(
                "'{}' still requesting tools after {} rounds",
                request.label, ctx.max_tool_rounds
            )));
        }

        let mut results = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            ctx.check_cancelled()?;
            info!(label = %request.label, tool = %invocation.name, round = rounds, "tool invocation");
            emit(
                &ctx.event_handler,
                Event::ToolInvocation {
                    name: request.label.clone(),
                    tool: invocation.name.clone(),
                    round: rounds,
                },
            );
            let output = registry.dispatch(invocation).await?;
            results.push(ContentBlock::ToolResult {
                tool_use_id: invocation.id.clone(),
                output,
            });
        }

        llm_request.turns.push(Turn::assistant(response.content.clone()));
        llm_request.turns.push(Turn::user(results));
    }
}

/// [`exchange`] returning only the final text.
pub async fn exchange_text(
    ctx: &ExecCtx,
    request: &ExchangeRequest,
    capabilities: Option<&CapabilityRegistry>,
) -> Result<String> {
    exchange(ctx, request, capabilities).await.map(|o| o.text)
}

async fn send(ctx: &ExecCtx, label: &str, request: &LlmRequest) -> Result<LlmResponse> {
    let handler = ctx.event_handler.clone();
    let name = label.to_string();
    let mut on_retry = move |attempt: u32, delay: Duration, reason: &str| {
        emit(
            &handler,
            Event::TransportRetry {
                name: name.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason: reason.to_string(),
            },
        );
    };

    debug!(label, model = %request.model, turns = request.turns.len(), "sending request");
    with_backoff(
        &ctx.backend,
        &ctx.client,
        &ctx.base_url,
        request,
        &ctx.backoff,
        Some(&ctx.cancellation),
        Some(&mut on_retry),
    )
    .await
}

fn finish(response: LlmResponse, usage: Usage, tool_rounds: u32, requests: u32) -> Result<ExchangeOutcome> {
    match response.text() {
        Some(text) => Ok(ExchangeOutcome {
            text,
            stop_reason: response.stop_reason,
            usage,
            tool_rounds,
            requests,
        }),
        None => Err(PipelineError::Protocol(
            "response carried neither text nor a usable tool invocation".into(),
        )),
    }
}
