//! Runs the purchase-order document flow offline against a scripted backend.
//!
//! ```sh
//! RUST_LOG=llm_docflow=debug cargo run --example document_batch
//! ```

use std::sync::Arc;

use llm_docflow::backend::{ContentBlock, LlmRequest, ToolOutput, ToolSpec};
use llm_docflow::{
    CapabilityRegistry, Document, DocumentParseNode, Event, ExecCtx, Executor, FnCapability, FnEventHandler,
    GraphBuilder, JsonFileSink, LlmCall, MockBackend, MockReply, PipelineState, ProcessingConfig, ResultSink,
    Router, END,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn prompt_text(request: &LlmRequest) -> String {
    request.turns[0]
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn attachment(request: &LlmRequest) -> Option<String> {
    request.turns[0].content.iter().find_map(|block| match block {
        ContentBlock::Document { name, .. } => Some(name.clone()),
        _ => None,
    })
}

/// Stands in for the hosted service: classifies by attachment name and
/// answers the follow-up prompts.
fn respond(request: &LlmRequest) -> MockReply {
    if let Some(name) = attachment(request) {
        let doc_type = if name.contains("po") { "Purchase Order" } else { "Invoice" };
        return MockReply::text(format!(
            "Extracted fields:\n{}",
            json!({"doc_type": doc_type, "number": name.to_uppercase()})
        ));
    }
    let prompt = prompt_text(request);
    if prompt.starts_with("Does the batch contain") {
        let answer = if prompt.contains("Purchase Order") { "Yes" } else { "No" };
        MockReply::text(answer)
    } else if prompt.starts_with("Review the checklist") {
        MockReply::text(r#"{"signatures": "present", "dates": "consistent"}"#)
    } else {
        MockReply::text(r#"{"valid": true, "issues": []}"#)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ProcessingConfig {
        batch_delay_ms: 200,
        ..ProcessingConfig::from_env()?
    };
    for warning in config.validate()? {
        eprintln!("config warning: {warning}");
    }

    let backend = Arc::new(MockBackend::from_fn(respond));
    let ctx = ExecCtx::from_config(&config)
        .backend(backend.clone())
        .event_handler(Arc::new(FnEventHandler(|event: Event| {
            if let Event::DocumentDone { document, ok, .. } = event {
                println!("  parsed {document}: {}", if ok { "ok" } else { "error" });
            }
        })))
        .build();

    let registry = CapabilityRegistry::new().with(FnCapability::new(
        ToolSpec::new(
            "lookup_vendor",
            "Look up a vendor by purchase order number",
            json!({"type": "object", "properties": {"number": {"type": "string"}}}),
        ),
        |input| Ok(ToolOutput::Json(json!({"vendor": "Acme Supply", "number": input["number"]}))),
    ));

    let graph = GraphBuilder::new()
        .add_node(Arc::new(DocumentParseNode::from_config(
            "Parse Documents",
            "Extract the document type and key identifiers as JSON.",
            &config,
        )))
        .add_node(Arc::new(
            LlmCall::new("Checklist", "Review the checklist against {parsed_data}")
                .with_inputs(["parsed_data"])
                .expecting_json(),
        ))
        .add_node(Arc::new(
            LlmCall::new("Check PO Exists", "Does the batch contain a purchase order? {parsed_data}")
                .with_inputs(["parsed_data"])
                .with_output_key("po_check"),
        ))
        .add_node(Arc::new(
            LlmCall::new("Validate PO data", "Validate the purchase order in {parsed_data}")
                .with_inputs(["parsed_data"])
                .with_output_key("validation_result")
                .with_capabilities(registry)
                .expecting_json(),
        ))
        .set_entry("Parse Documents")
        .add_edge("Parse Documents", "Checklist")
        .add_edge("Parse Documents", "Check PO Exists")
        .add_conditional_edges(
            "Check PO Exists",
            Router::from_key("po_check", ["Yes", "No"]),
            [("Yes", "Validate PO data"), ("No", END)],
        )
        .build()?;

    let state = PipelineState::new(vec![
        Document::new("po-4500.pdf", b"%PDF-1.7 purchase order".to_vec()),
        Document::new("invoice-981.pdf", b"%PDF-1.7 invoice".to_vec()),
        Document::new("notes.txt", "delivery notes"),
    ]);

    let outcome = Executor::new(graph)
        .run_with_observer(&ctx, state, |result| {
            let status = result.error.as_deref().unwrap_or("ok");
            println!("{} -> {status}", result.node);
        })
        .await?;

    println!("completed: {:?}", outcome.completed);
    println!("skipped:   {:?}", outcome.skipped);
    println!("requests:  {}", backend.request_count());

    let dir = tempfile::tempdir()?;
    let sink = JsonFileSink::new(dir.path().join("results.json")).skip_keys(["raw", "uploaded_files"]);
    sink.deliver(&outcome.state).await?;
    println!("{}", tokio::fs::read_to_string(sink.path()).await?);
    Ok(())
}
