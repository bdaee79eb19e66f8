//! Per-document fan-out node.
//!
//! [`DocumentParseNode`] sends every input document to the service in its
//! own exchange and collects the parsed replies into one mapping keyed by
//! document name. Documents are grouped into batches bounded by count and
//! combined size; a batch runs concurrently up to `max_concurrent`, and the
//! node pauses between batches to stay clear of service rate limits.
//!
//! A document that cannot be preprocessed, exchanged or parsed gets an
//! error entry in place of its result. It never fails the node or delays
//! its siblings.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::client::{exchange_text, ExchangeRequest};
use crate::config::ProcessingConfig;
use crate::document::Document;
use crate::error::{PipelineError, Result};
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::node::{BoxFut, TaskNode};
use crate::parsing::parse_json_like;
use crate::preprocess::Preprocessor;
use crate::state::{error_entry, PipelineState, StateMap};
use crate::tools::CapabilityRegistry;

/// State key written by [`DocumentParseNode`] unless overridden.
pub const DEFAULT_OUTPUT_KEY: &str = "parsed_data";

/// Parses every document in the state through the service.
///
/// Writes `{output_key: {document_name: {"result": ...} | error_entry}}`.
///
/// # Example
///
/// ```
/// use llm_docflow::fan_out::DocumentParseNode;
/// use llm_docflow::config::ProcessingConfig;
///
/// let node = DocumentParseNode::from_config(
///     "Parse Documents",
///     "Extract the document type and key fields as JSON.",
///     &ProcessingConfig::default(),
/// );
/// ```
pub struct DocumentParseNode {
    name: String,
    prompt: String,
    output_key: String,
    model_id: Option<String>,
    capabilities: Option<CapabilityRegistry>,
    preprocessor: Arc<Preprocessor>,
    max_concurrent: usize,
    batch_size: usize,
    max_batch_bytes: usize,
    batch_delay: Duration,
}

impl DocumentParseNode {
    /// A node with default limits and no pause between batches.
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let defaults = ProcessingConfig::default();
        Self {
            name: name.into(),
            prompt: prompt.into(),
            output_key: DEFAULT_OUTPUT_KEY.into(),
            model_id: None,
            capabilities: None,
            preprocessor: Arc::new(Preprocessor::new(defaults.preprocess_limits())),
            max_concurrent: defaults.max_concurrent_requests,
            batch_size: defaults.max_documents_per_batch,
            max_batch_bytes: defaults.max_batch_bytes,
            batch_delay: Duration::ZERO,
        }
    }

    /// A node whose limits, pacing and model come from `config`.
    pub fn from_config(name: impl Into<String>, prompt: impl Into<String>, config: &ProcessingConfig) -> Self {
        Self {
            model_id: Some(config.model_id.clone()),
            preprocessor: Arc::new(Preprocessor::new(config.preprocess_limits())),
            max_concurrent: config.max_concurrent_requests.max(1),
            batch_size: config.max_documents_per_batch.max(1),
            max_batch_bytes: config.max_batch_bytes,
            batch_delay: config.batch_delay(),
            ..Self::new(name, prompt)
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Offer these capabilities to the service during each exchange.
    pub fn with_capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Some(registry);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = Arc::new(preprocessor);
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_batching(mut self, batch_size: usize, max_batch_bytes: usize, delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_batch_bytes = max_batch_bytes;
        self.batch_delay = delay;
        self
    }

    /// Preprocess, exchange and parse one document.
    async fn parse_one(&self, ctx: &ExecCtx, doc: &Document) -> Result<Value> {
        ctx.check_cancelled()?;
        let preprocessor = self.preprocessor.clone();
        let original = doc.clone();
        let prepared = tokio::task::spawn_blocking(move || preprocessor.prepare(&original))
            .await
            .map_err(|e| PipelineError::Other(format!("preprocessing task failed: {e}")))??;
        if prepared.size() != doc.size() {
            debug!(document = doc.name(), from = doc.size(), to = prepared.size(), "document shrunk");
        }

        let mut request = ExchangeRequest::new(doc.name(), self.prompt.clone()).with_attachment(prepared);
        if let Some(model) = &self.model_id {
            request = request.with_model(model.clone());
        }
        let text = exchange_text(ctx, &request, self.capabilities.as_ref()).await?;
        parse_json_like(&text)
    }

    async fn parse_indexed(&self, ctx: &ExecCtx, docs: &[Document], idx: usize) -> (usize, Result<Value>) {
        (idx, self.parse_one(ctx, &docs[idx]).await)
    }
}

impl TaskNode for DocumentParseNode {
    fn kind(&self) -> &'static str {
        "document-parse"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, ctx: &'a ExecCtx, state: Arc<PipelineState>) -> BoxFut<'a, Result<StateMap>> {
        Box::pin(async move {
            let docs = state.documents();
            let keys = unique_keys(docs);
            let batches = plan_batches(docs, self.batch_size, self.max_batch_bytes);
            info!(node = %self.name, documents = docs.len(), batches = batches.len(), "fan-out started");

            let mut results = Map::new();
            for (i, batch) in batches.iter().enumerate() {
                if i > 0 && !self.batch_delay.is_zero() {
                    debug!(node = %self.name, delay_ms = self.batch_delay.as_millis() as u64, "pausing between batches");
                    tokio::select! {
                        _ = ctx.cancellation.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(self.batch_delay) => {}
                    }
                }
                ctx.check_cancelled()?;

                let pending: Vec<_> = batch.iter().map(|&idx| self.parse_indexed(ctx, docs, idx)).collect();
                let finished: Vec<(usize, Result<Value>)> =
                    stream::iter(pending).buffer_unordered(self.max_concurrent).collect().await;

                for (idx, outcome) in finished {
                    let key = keys[idx].clone();
                    let entry = match outcome {
                        Ok(value) => json!({ "result": value }),
                        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                        Err(e) => {
                            warn!(node = %self.name, document = %key, error = %e, "document failed");
                            error_entry(&e)
                        }
                    };
                    emit(
                        &ctx.event_handler,
                        Event::DocumentDone {
                            node: self.name.clone(),
                            document: key.clone(),
                            ok: !crate::state::is_error_entry(&entry),
                        },
                    );
                    results.insert(key, entry);
                }
            }

            let mut update = StateMap::new();
            update.insert(self.output_key.clone(), Value::Object(results));
            Ok(update)
        })
    }
}

/// Result keys for `docs`: the document name, or for a repeat the first of
/// `name (2)`, `name (3)`, ... not already taken, so no document overwrites
/// another even when a real name looks like a suffixed one.
pub fn unique_keys(docs: &[Document]) -> Vec<String> {
    let mut issued: HashSet<String> = HashSet::new();
    docs.iter()
        .map(|doc| {
            let mut key = doc.name().to_string();
            let mut n = 2;
            while issued.contains(&key) {
                key = format!("{} ({n})", doc.name());
                n += 1;
            }
            issued.insert(key.clone());
            key
        })
        .collect()
}

/// Split document indices into consecutive batches of at most `batch_size`
/// documents and `max_bytes` combined size. A single document larger than
/// `max_bytes` gets a batch of its own.
pub fn plan_batches(docs: &[Document], batch_size: usize, max_bytes: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for (idx, doc) in docs.iter().enumerate() {
        let full = current.len() >= batch_size || (!current.is_empty() && current_bytes + doc.size() > max_bytes);
        if full {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(idx);
        current_bytes += doc.size();
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContentBlock, LlmRequest, MockBackend, MockReply};
    use crate::events::FnEventHandler;
    use crate::preprocess::PreprocessLimits;
    use crate::retry::BackoffConfig;
    use std::sync::Mutex;

    fn attached_name(request: &LlmRequest) -> String {
        request.turns[0]
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::Document { name, .. } => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn echo_backend() -> Arc<MockBackend> {
        Arc::new(MockBackend::from_fn(|request| {
            MockReply::text(format!("Here you go: {{\"doc\": \"{}\"}}", attached_name(request)))
        }))
    }

    fn ctx_with(backend: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://mock")
            .backend(backend)
            .backoff(BackoffConfig::none())
            .build()
    }

    fn small_limits() -> Preprocessor {
        Preprocessor::new(PreprocessLimits {
            max_bytes: 64,
            max_pages: 50,
        })
    }

    #[tokio::test]
    async fn test_one_oversize_document_does_not_shrink_batch() {
        let backend = echo_backend();
        let ctx = ctx_with(backend.clone());
        let state = Arc::new(PipelineState::new(vec![
            Document::new("invoice.txt", "invoice body"),
            Document::new("po.txt", "purchase order"),
            Document::new("huge.txt", vec![b'x'; 1024]),
            Document::new("receipt.txt", "receipt"),
        ]));
        let node = DocumentParseNode::new("Parse Documents", "Extract fields.").with_preprocessor(small_limits());

        let update = node.execute(&ctx, state).await.unwrap();
        let parsed = update[DEFAULT_OUTPUT_KEY].as_object().unwrap();

        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed["invoice.txt"]["result"]["doc"], "invoice");
        assert_eq!(parsed["po.txt"]["result"]["doc"], "po");
        assert_eq!(parsed["receipt.txt"]["result"]["doc"], "receipt");
        assert_eq!(parsed["huge.txt"]["error_kind"], "oversize");
        assert!(parsed["huge.txt"]["result"].is_null());
        assert_eq!(backend.request_count(), 3);
    }

    #[tokio::test]
    async fn test_unparsable_reply_keeps_raw() {
        let backend = Arc::new(MockBackend::fixed("I could not read this file."));
        let ctx = ctx_with(backend);
        let state = Arc::new(PipelineState::new(vec![Document::new("scan.txt", "???")]));
        let node = DocumentParseNode::new("Parse Documents", "Extract fields.");

        let update = node.execute(&ctx, state).await.unwrap();
        let entry = &update[DEFAULT_OUTPUT_KEY]["scan.txt"];
        assert_eq!(entry["error_kind"], "parse");
        assert_eq!(entry["raw"], "I could not read this file.");
    }

    #[tokio::test]
    async fn test_service_failure_is_per_document() {
        let backend = Arc::new(MockBackend::from_fn(|request| {
            if attached_name(request) == "bad" {
                MockReply::Fail("internal error".into())
            } else {
                MockReply::text("{\"ok\": true}")
            }
        }));
        let ctx = ctx_with(backend);
        let state = Arc::new(PipelineState::new(vec![
            Document::new("good.txt", "a"),
            Document::new("bad.txt", "b"),
        ]));
        let update = DocumentParseNode::new("Parse Documents", "p")
            .execute(&ctx, state)
            .await
            .unwrap();
        assert_eq!(update[DEFAULT_OUTPUT_KEY]["good.txt"]["result"]["ok"], true);
        assert_eq!(update[DEFAULT_OUTPUT_KEY]["bad.txt"]["error_kind"], "http");
    }

    #[tokio::test]
    async fn test_duplicate_names_are_kept() {
        let ctx = ctx_with(echo_backend());
        let state = Arc::new(PipelineState::new(vec![
            Document::new("scan.txt", "first"),
            Document::new("scan.txt", "second"),
            Document::new("a.txt", "third"),
            Document::new("a.txt (2)", "fourth"),
            Document::new("a.txt", "fifth"),
        ]));
        let update = DocumentParseNode::new("Parse Documents", "p")
            .execute(&ctx, state)
            .await
            .unwrap();
        let parsed = update[DEFAULT_OUTPUT_KEY].as_object().unwrap();
        assert_eq!(parsed.len(), 5);
        for key in ["scan.txt", "scan.txt (2)", "a.txt", "a.txt (2)", "a.txt (3)"] {
            assert!(parsed.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_unique_keys_skip_taken_suffixes() {
        let docs: Vec<Document> = ["a.txt", "a.txt (2)", "a.txt", "a.txt", "b.txt"]
            .into_iter()
            .map(|name| Document::new(name, "x"))
            .collect();
        assert_eq!(
            unique_keys(&docs),
            vec!["a.txt", "a.txt (2)", "a.txt (3)", "a.txt (4)", "b.txt"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_paced() {
        let backend = echo_backend();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let ctx = ExecCtx::builder("http://mock")
            .backend(backend.clone())
            .event_handler(Arc::new(FnEventHandler(move |e: Event| {
                if let Event::DocumentDone { document, ok, .. } = e {
                    sink.lock().unwrap().push((document, ok));
                }
            })))
            .build();
        let state = Arc::new(PipelineState::new(vec![
            Document::new("a.txt", "a"),
            Document::new("b.txt", "b"),
            Document::new("c.txt", "c"),
        ]));
        let node = DocumentParseNode::new("Parse Documents", "p").with_batching(2, usize::MAX, Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        node.execute(&ctx, state).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(backend.request_count(), 3);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], ("c.txt".to_string(), true));
    }

    #[test]
    fn test_plan_batches_by_count_and_size() {
        let docs = vec![
            Document::new("a.txt", vec![0u8; 10]),
            Document::new("b.txt", vec![0u8; 10]),
            Document::new("c.txt", vec![0u8; 10]),
            Document::new("d.txt", vec![0u8; 50]),
            Document::new("e.txt", vec![0u8; 5]),
        ];
        assert_eq!(plan_batches(&docs, 2, usize::MAX), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(plan_batches(&docs, 10, 30), vec![vec![0, 1, 2], vec![3], vec![4]]);
        assert!(plan_batches(&[], 4, 100).is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = ProcessingConfig {
            max_concurrent_requests: 2,
            batch_delay_ms: 250,
            ..ProcessingConfig::default()
        };
        let node = DocumentParseNode::from_config("Parse Documents", "p", &config);
        assert_eq!(node.max_concurrent, 2);
        assert_eq!(node.batch_delay, Duration::from_millis(250));
        assert_eq!(node.model_id.as_deref(), Some(config.model_id.as_str()));
        assert_eq!(node.kind(), "document-parse");
    }
}
