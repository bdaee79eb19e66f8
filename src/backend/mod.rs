//! Backend trait and normalized conversation types.
//!
//! The [`Backend`] trait abstracts the generative service boundary,
//! translating between the normalized [`LlmRequest`]/[`LlmResponse`] types
//! and a provider HTTP API. Built-in implementations: [`ConverseBackend`]
//! and the offline [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! exchange ──► LlmRequest ──► with_backoff ──► Backend::complete() ──► LlmResponse
//!                                                     │
//!                                          ┌──────────┴──────────┐
//!                                   ConverseBackend          MockBackend
//!                          POST /model/{id}/converse     scripted replies
//! ```

pub mod converse;
pub mod mock;

pub use converse::ConverseBackend;
pub use mock::{MockBackend, MockReply};

use crate::client::LlmConfig;
use crate::error::Result;
use crate::retry::{with_retry, BackoffConfig, RetryCallback};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A normalized service request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation so far. The first turn is the user's prompt and attachments.
    pub turns: Vec<Turn>,

    /// Generation parameters.
    pub config: LlmConfig,

    /// Tool declarations offered to the model. Empty means no tool use.
    pub tools: Vec<ToolSpec>,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A content block inside a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Plain text.
    Text(String),
    /// Named binary document attachment.
    Document {
        name: String,
        format: String,
        bytes: bytes::Bytes,
    },
    /// Binary image attachment.
    Image { format: String, bytes: bytes::Bytes },
    /// A tool invocation requested by the model.
    ToolUse(ToolInvocation),
    /// The result of a locally executed tool.
    ToolResult {
        tool_use_id: String,
        output: ToolOutput,
    },
}

/// A structured request from the model to run a named local capability.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Provider-assigned id, echoed back in the tool result.
    pub id: String,
    /// Capability name.
    pub name: String,
    /// Structured input.
    pub input: Value,
}

/// Return value of a capability.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// Token accounting for one or more requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "inputTokens", default)]
    pub input: u64,
    #[serde(rename = "outputTokens", default)]
    pub output: u64,
    #[serde(rename = "totalTokens", default)]
    pub total: u64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.total += rhs.total;
    }
}

/// A normalized service response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Content blocks of the assistant message.
    pub content: Vec<ContentBlock>,

    pub stop_reason: StopReason,

    pub usage: Usage,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,
}

impl LlmResponse {
    /// A terminal text response.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text(text.into())],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
            status: 200,
        }
    }

    /// A response requesting one tool invocation.
    pub fn from_tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            content: vec![ContentBlock::ToolUse(ToolInvocation {
                id: id.into(),
                name: name.into(),
                input,
            })],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
            status: 200,
        }
    }

    /// Concatenated text blocks, or `None` if there are none.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }

    /// Tool invocations in the order the model issued them.
    pub fn tool_invocations(&self) -> Vec<&ToolInvocation> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

/// A tool declaration in the Converse `toolSpec` shape.
///
/// ```
/// use llm_docflow::backend::ToolSpec;
///
/// let spec = ToolSpec::from_json_str(r#"{"toolSpec": {
///     "name": "lookup_vendor",
///     "description": "Find a vendor by name",
///     "inputSchema": {"json": {"type": "object"}}
/// }}"#).unwrap();
/// assert_eq!(spec.name, "lookup_vendor");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    pub json: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: ToolInputSchema { json: schema },
        }
    }

    /// Parse a spec, accepting either the bare object or one wrapped as
    /// `{"toolSpec": {...}}`.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let inner = match value.get("toolSpec") {
            Some(spec) => spec.clone(),
            None => value,
        };
        Ok(serde_json::from_value(inner)?)
    }
}

/// Abstraction over the generative service.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one request/response round.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Execute a backend call under the throttling retry policy.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    cancel: Option<&CancellationToken>,
    on_retry: RetryCallback<'_>,
) -> Result<LlmResponse> {
    with_retry(config, cancel, on_retry, move |_| {
        backend.complete(client, base_url, request)
    })
    .await
}
