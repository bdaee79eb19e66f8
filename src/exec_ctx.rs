//! Run-scoped execution context.
//!
//! [`ExecCtx`] carries the HTTP client, service backend, endpoint, retry
//! policy, template variables, cancellation token, and optional event
//! handler. It is constructed once per run and passed by reference to
//! every node; nothing here is process-global.

use crate::backend::{Backend, ConverseBackend};
use crate::client::LlmConfig;
use crate::config::ProcessingConfig;
use crate::events::EventHandler;
use crate::retry::BackoffConfig;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default cap on tool rounds within one exchange.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 3;

/// Shared execution context for one pipeline run.
///
/// # Example
///
/// ```
/// use llm_docflow::ExecCtx;
///
/// let ctx = ExecCtx::builder("https://bedrock-runtime.us-west-2.amazonaws.com")
///     .default_model("us.anthropic.claude-3-7-sonnet-20250219-v1:0")
///     .var("customer", "Acme")
///     .build();
/// assert!(!ctx.is_cancelled());
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone, uses `Arc` internally).
    pub client: Client,
    /// Service base URL.
    pub base_url: String,
    /// Service backend. Default: [`ConverseBackend`] without credentials.
    pub backend: Arc<dyn Backend>,
    /// Throttling retry policy. Default: [`BackoffConfig::throttling()`].
    pub backoff: BackoffConfig,
    /// Template variables substituted into prompt `{key}` placeholders.
    pub vars: HashMap<String, String>,
    /// Cancellation token for the whole run. Child tokens may be derived.
    pub cancellation: CancellationToken,
    /// Optional event handler for lifecycle and streaming events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
    /// Maximum tool rounds per exchange before a protocol error.
    pub max_tool_rounds: u32,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Generation parameters used when a request does not carry its own.
    pub llm_config: LlmConfig,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            backoff: None,
            vars: HashMap::new(),
            cancellation: None,
            event_handler: None,
            timeout: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            default_model: String::new(),
            llm_config: LlmConfig::default(),
        }
    }

    /// Builder pre-populated from a [`ProcessingConfig`]: endpoint, model,
    /// retry policy, request timeout and tool-round cap.
    pub fn from_config(config: &ProcessingConfig) -> ExecCtxBuilder {
        Self::builder(config.endpoint())
            .default_model(config.model_id.clone())
            .backoff(config.backoff())
            .timeout(config.request_timeout())
            .max_tool_rounds(config.max_tool_rounds)
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            return Err(crate::PipelineError::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("backoff", &self.backoff)
            .field("vars_count", &self.vars.len())
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("has_event_handler", &self.event_handler.is_some())
            .field("max_tool_rounds", &self.max_tool_rounds)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    backoff: Option<BackoffConfig>,
    vars: HashMap<String, String>,
    cancellation: Option<CancellationToken>,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
    max_tool_rounds: u32,
    default_model: String,
    llm_config: LlmConfig,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the service backend.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the Converse backend with bearer-token authentication.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(ConverseBackend::new().with_bearer_token(token)));
        self
    }

    /// Set the retry policy.
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Set all template variables at once.
    pub fn vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    /// Insert a single template variable.
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Use an externally owned cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the request timeout. Default: 30 seconds.
    ///
    /// Ignored when a custom `Client` is supplied via `.client()`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cap on tool rounds per exchange.
    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Model used when a request does not name one.
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Default generation parameters.
    pub fn llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    /// Build the execution context.
    pub fn build(self) -> ExecCtx {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));
        let client = self.client.unwrap_or_else(|| {
            Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new())
        });
        ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(ConverseBackend::new())),
            backoff: self.backoff.unwrap_or_default(),
            vars: self.vars,
            cancellation: self.cancellation.unwrap_or_default(),
            event_handler: self.event_handler,
            max_tool_rounds: self.max_tool_rounds,
            default_model: self.default_model,
            llm_config: self.llm_config,
        }
    }
}

/// Strip a trailing slash and any `/model/...` operation path so the
/// backend can append its own path without doubling it.
/// e.g. "https://host/model/m/converse" -> "https://host"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    match trimmed.find("/model/") {
        Some(idx) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://bedrock-runtime.us-west-2.amazonaws.com/"),
            "https://bedrock-runtime.us-west-2.amazonaws.com"
        );
    }

    #[test]
    fn test_normalize_base_url_strips_operation_path() {
        assert_eq!(
            normalize_base_url("http://localhost:8080/model/claude/converse"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_normalize_base_url_preserves_clean() {
        assert_eq!(normalize_base_url("http://gateway:9000/proxy"), "http://gateway:9000/proxy");
    }

    #[test]
    fn test_defaults() {
        let ctx = ExecCtx::builder("http://unused").build();
        assert_eq!(ctx.backend.name(), "converse");
        assert_eq!(ctx.backoff, BackoffConfig::throttling());
        assert_eq!(ctx.max_tool_rounds, DEFAULT_MAX_TOOL_ROUNDS);
        assert!(ctx.check_cancelled().is_ok());
    }

    #[test]
    fn test_shared_token_cancels() {
        let token = CancellationToken::new();
        let ctx = ExecCtx::builder("http://unused")
            .cancellation(token.clone())
            .build();
        token.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(crate::PipelineError::Cancelled)));
    }

    #[test]
    fn test_from_config() {
        let config = ProcessingConfig {
            max_tool_rounds: 5,
            ..ProcessingConfig::default()
        };
        let ctx = ExecCtx::from_config(&config).build();
        assert_eq!(ctx.max_tool_rounds, 5);
        assert_eq!(ctx.default_model, config.model_id);
        assert_eq!(ctx.base_url, "https://bedrock-runtime.us-west-2.amazonaws.com");
    }
}
