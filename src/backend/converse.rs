//! Backend for Converse-style generative service APIs.
//!
//! Endpoint: `POST {base}/model/{modelId}/converse`.
//! Binary attachments are sent base64 encoded inside `document` and
//! `image` blocks; tool declarations go in `toolConfig`.

use super::{Backend, ContentBlock, LlmRequest, LlmResponse, StopReason, ToolInvocation, ToolOutput, Usage};
use crate::error::Result;
use crate::PipelineError;
use crate::retry::mentions_rate_limit;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Backend speaking the Converse JSON protocol.
///
/// # Example
///
/// ```
/// use llm_docflow::backend::ConverseBackend;
///
/// let open = ConverseBackend::new();
/// let gated = ConverseBackend::new().with_bearer_token("token");
/// assert!(gated.has_bearer_token());
/// ```
#[derive(Clone, Default)]
pub struct ConverseBackend {
    /// Optional token, sent as `Authorization: Bearer {token}`.
    pub(crate) bearer_token: Option<String>,
}

impl std::fmt::Debug for ConverseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverseBackend")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ConverseBackend {
    pub fn new() -> Self {
        Self { bearer_token: None }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn has_bearer_token(&self) -> bool {
        self.bearer_token.is_some()
    }

    /// Build the Converse request body.
    pub(crate) fn build_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .turns
            .iter()
            .map(|turn| {
                json!({
                    "role": turn.role.as_str(),
                    "content": turn.content.iter().map(encode_block).collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut inference = Map::new();
        inference.insert("temperature".into(), json!(request.config.temperature));
        if let Some(max) = request.config.max_tokens {
            inference.insert("maxTokens".into(), json!(max));
        }
        if let Some(top_p) = request.config.top_p {
            inference.insert("topP".into(), json!(top_p));
        }

        let mut body = json!({
            "messages": messages,
            "inferenceConfig": Value::Object(inference),
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|spec| json!({ "toolSpec": spec }))
                .collect();
            body["toolConfig"] = json!({ "tools": tools });
        }

        body
    }

    /// Parse a successful Converse response body.
    pub(crate) fn parse_response(status: u16, body: &Value) -> Result<LlmResponse> {
        let blocks = body
            .pointer("/output/message/content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| {
                PipelineError::Protocol("response has no output.message.content array".into())
            })?;

        let mut content = Vec::with_capacity(blocks.len());
        for block in blocks {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                content.push(ContentBlock::Text(text.to_string()));
            } else if let Some(tool) = block.get("toolUse") {
                content.push(ContentBlock::ToolUse(decode_tool_use(tool)?));
            }
            // Other block kinds (reasoning, citations) carry nothing the pipeline consumes.
        }

        let stop_reason = body
            .get("stopReason")
            .and_then(|s| s.as_str())
            .map(StopReason::parse)
            .unwrap_or(StopReason::EndTurn);

        let usage = match body.get("usage") {
            Some(u) => serde_json::from_value::<Usage>(u.clone())?,
            None => Usage::default(),
        };

        Ok(LlmResponse {
            content,
            stop_reason,
            usage,
            status,
        })
    }

    /// Map a non-success response onto the error taxonomy.
    pub(crate) fn classify_error(
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    ) -> PipelineError {
        if status == 429 || mentions_rate_limit(&body) {
            PipelineError::Throttling {
                message: body,
                retry_after,
            }
        } else {
            PipelineError::HttpError {
                status,
                body,
                retry_after,
            }
        }
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    fn build_http_request(&self, client: &Client, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if let Some(ref token) = self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

fn encode_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text(text) => json!({ "text": text }),
        ContentBlock::Document {
            name,
            format,
            bytes,
        } => json!({
            "document": {
                "name": name,
                "format": format,
                "source": { "bytes": STANDARD.encode(bytes) },
            }
        }),
        ContentBlock::Image { format, bytes } => json!({
            "image": {
                "format": format,
                "source": { "bytes": STANDARD.encode(bytes) },
            }
        }),
        ContentBlock::ToolUse(inv) => json!({
            "toolUse": {
                "toolUseId": inv.id,
                "name": inv.name,
                "input": inv.input,
            }
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
        } => {
            let content = match output {
                ToolOutput::Text(text) => json!({ "text": text }),
                ToolOutput::Json(value) => json!({ "json": value }),
            };
            json!({
                "toolResult": {
                    "toolUseId": tool_use_id,
                    "content": [content],
                    "status": "success",
                }
            })
        }
    }
}

fn decode_tool_use(tool: &Value) -> Result<ToolInvocation> {
    let id = tool.get("toolUseId").and_then(|v| v.as_str());
    let name = tool.get("name").and_then(|v| v.as_str());
    match (id, name) {
        (Some(id), Some(name)) => Ok(ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            input: tool.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => Err(PipelineError::Protocol(format!(
            "toolUse block missing toolUseId or name: {tool}"
        ))),
    }
}

#[async_trait]
impl Backend for ConverseBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{}/model/{}/converse", base, request.model);
        let body = Self::build_body(request);

        let resp = self
            .build_http_request(client, &url, &body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Other(format!("Failed to reach service at {}: {}", url, e))
            })?;

        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, text, retry_after));
        }

        let json_resp: Value = resp.json().await?;
        Self::parse_response(status, &json_resp)
    }

    fn name(&self) -> &'static str {
        "converse"
    }
}
