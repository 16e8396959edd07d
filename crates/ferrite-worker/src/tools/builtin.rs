use async_trait::async_trait;
use serde_json::{json, Value};

use ferrite_providers::Llm;
use ferrite_types::{CapabilityLevel, RiskLevel, ToolMeta};

use crate::tools::{InvokeScope, ToolError, ToolProvider};

fn builtin_tool_meta(provider_id: &str) -> Vec<ToolMeta> {
    let mk = |name: &str, schema: Value| ToolMeta {
        name: name.to_string(),
        input_schema: schema,
        provider_id: provider_id.to_string(),
        risk_level: RiskLevel::ReadOnly,
        side_effects: false,
        capability_level: CapabilityLevel::L0,
        requires_confirm: false,
        timeout_ms: 15_000,
    };
    vec![
        mk(
            "web.search",
            json!({"type": "object", "properties": {"query": {"type": "string"}, "max_results": {"type": "integer"}}, "required": ["query"]}),
        ),
        mk(
            "web.fetch",
            json!({"type": "object", "properties": {"url": {"type": "string"}}, "required": ["url"]}),
        ),
        mk(
            "text.summarize",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        ),
    ]
}

pub fn web_search_stub(args: &Value) -> Value {
    let q: String = args
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .chars()
        .take(50)
        .collect();
    json!({"items": [
        {"title": format!("Stub result for: {q}"), "url": "https://example.com/stub/1", "snippet": "Stub snippet 1.", "provider": "stub", "rank": 1},
        {"title": "Stub result 2", "url": "https://example.com/stub/2", "snippet": "Stub snippet 2.", "provider": "stub", "rank": 2},
    ]})
}

pub fn web_fetch_stub(args: &Value) -> Result<Value, ToolError> {
    let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ToolError::Other("url must be http:// or https://".to_string()));
    }
    Ok(json!({
        "url": url,
        "status_code": 200,
        "content_type": "text/html",
        "text": format!("Stub content for {url}"),
        "truncated": false,
    }))
}

async fn text_summarize(llm: Option<&dyn Llm>, args: &Value) -> Value {
    let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
    match llm {
        Some(llm) => {
            let prompt = format!("Summarize the following text in a few sentences:\n\n{text}");
            match llm.generate(&prompt).await {
                Ok(summary) => json!({"summary": summary}),
                Err(err) => json!({"summary": format!("(summarize failed: {err})")}),
            }
        }
        None => json!({"summary": "(no llm)"}),
    }
}

/// Built-in tools with stub web implementations; shadowed by the real web
/// provider when one is configured.
pub struct BuiltinProvider;

#[async_trait]
impl ToolProvider for BuiltinProvider {
    fn provider_id(&self) -> &str {
        "builtin"
    }

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError> {
        Ok(builtin_tool_meta("builtin"))
    }

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        _scope: InvokeScope<'_>,
        llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "web.search" => Ok(web_search_stub(args)),
            "web.fetch" => web_fetch_stub(args),
            "text.summarize" => Ok(text_summarize(llm, args).await),
            other => Err(ToolError::not_found(other, "not a builtin tool")),
        }
    }
}

/// Development provider: same tool names as builtin under its own id, so
/// resolution order can be exercised in tests.
pub struct StubProvider;

#[async_trait]
impl ToolProvider for StubProvider {
    fn provider_id(&self) -> &str {
        "stub"
    }

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError> {
        Ok(builtin_tool_meta("stub"))
    }

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        _scope: InvokeScope<'_>,
        llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "web.search" => Ok(web_search_stub(args)),
            "web.fetch" => web_fetch_stub(args),
            "text.summarize" => Ok(text_summarize(llm, args).await),
            other => Err(ToolError::not_found(other, "not a stub tool")),
        }
    }
}
