use async_trait::async_trait;
use serde_json::{json, Map, Value};

use ferrite_providers::Llm;
use ferrite_types::{CapabilityLevel, RiskLevel, ToolMeta};

use crate::tools::web_backends::{WebError, WebFetchBackend, WebSearchBackend};
use crate::tools::{InvokeScope, ToolError, ToolProvider};

pub const TITLE_MAX: usize = 512;
pub const URL_MAX: usize = 2048;
pub const SNIPPET_MAX: usize = 4096;
pub const PROVIDER_MAX: usize = 64;

pub const DEFAULT_WEB_SEARCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_RESULTS: usize = 5;

fn is_valid_search_url(value: Option<&Value>) -> bool {
    match value.and_then(|v| v.as_str()) {
        Some(url) => {
            let trimmed = url.trim();
            trimmed.starts_with("http://") || trimmed.starts_with("https://")
        }
        None => false,
    }
}

fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Guarantee every item has `title/url/snippet/provider/rank`. Items with a
/// missing or non-http(s) URL are dropped; non-string titles and snippets
/// are coerced; `rank` is written only here (1-based over the raw list).
pub fn normalize_search_items(raw_items: &[Value], backend_id: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for (i, item) in raw_items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            continue;
        };
        if !is_valid_search_url(obj.get("url")) {
            continue;
        }
        let coerce = |value: Option<&Value>| -> String {
            match value {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        };
        let url = obj.get("url").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        let provider = match obj.get("provider").and_then(|v| v.as_str()) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => backend_id.to_string(),
        };
        out.push(json!({
            "title": coerce(obj.get("title")),
            "url": url,
            "snippet": coerce(obj.get("snippet")),
            "provider": provider,
            "rank": i + 1,
        }));
    }
    out
}

/// Cap `title/url/snippet/provider` lengths; `rank` passes through.
pub fn truncate_fields(item: &Value) -> Value {
    let get = |key: &str| item.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let mut out = Map::new();
    out.insert("title".to_string(), json!(truncate_chars(get("title"), TITLE_MAX)));
    out.insert("url".to_string(), json!(truncate_chars(get("url"), URL_MAX)));
    out.insert(
        "snippet".to_string(),
        json!(truncate_chars(get("snippet"), SNIPPET_MAX)),
    );
    out.insert(
        "provider".to_string(),
        json!(truncate_chars(get("provider"), PROVIDER_MAX)),
    );
    if let Some(rank) = item.get("rank") {
        out.insert("rank".to_string(), rank.clone());
    }
    for key in ["published_at"] {
        if let Some(value) = item.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

/// Fill the canonical fetch shape: required `url/status_code/content_type/
/// text/truncated`, plus optional extractor and cache fields when present.
pub fn normalize_fetch_result(raw: &Value) -> Value {
    let text = raw
        .get("text")
        .and_then(|v| v.as_str())
        .or_else(|| raw.get("extracted_text").and_then(|v| v.as_str()))
        .unwrap_or("");
    let mut out = json!({
        "url": raw.get("url").and_then(|v| v.as_str()).unwrap_or("").trim(),
        "status_code": raw.get("status_code").and_then(|v| v.as_i64()).unwrap_or(0),
        "content_type": raw.get("content_type").and_then(|v| v.as_str()).unwrap_or("").trim(),
        "text": text,
        "truncated": raw.get("truncated").and_then(|v| v.as_bool()).unwrap_or(false),
    });
    for key in [
        "final_url",
        "title",
        "extracted_text",
        "extraction_method",
        "paragraphs_count",
        "cache_hit",
        "artifact_paths",
        "bytes_read",
    ] {
        if let Some(value) = raw.get(key) {
            if !value.is_null() {
                out[key] = value.clone();
            }
        }
    }
    out
}

const WEB_SEARCH_INPUT_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "query": {"type": "string", "minLength": 1},
        "max_results": {"type": "integer", "minimum": 1, "maximum": 10}
    },
    "required": ["query"]
}"#;

const WEB_FETCH_INPUT_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "url": {"type": "string", "minLength": 1},
        "timeout_ms": {"type": "integer", "minimum": 1000, "maximum": 120000}
    },
    "required": ["url"]
}"#;

/// Exposes `web.search` and `web.fetch`, delegating to swappable backends.
pub struct WebProvider {
    search_backend: Box<dyn WebSearchBackend>,
    fetch_backend: Box<dyn WebFetchBackend>,
    timeout_ms: u64,
    fetch_timeout_ms: u64,
    default_max_results: usize,
}

impl WebProvider {
    pub const PROVIDER_ID: &'static str = "web";

    pub fn new(
        search_backend: Box<dyn WebSearchBackend>,
        fetch_backend: Box<dyn WebFetchBackend>,
        timeout_ms: u64,
        fetch_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            search_backend,
            fetch_backend,
            timeout_ms,
            fetch_timeout_ms: fetch_timeout_ms.unwrap_or(timeout_ms),
            default_max_results: DEFAULT_MAX_RESULTS,
        }
    }

    async fn invoke_search(&self, args: &Value) -> Result<Value, WebError> {
        let query = match args.get("query") {
            None | Some(Value::Null) => {
                return Err(WebError::InvalidInput("query is required".to_string()))
            }
            Some(Value::String(s)) => s.trim().to_string(),
            Some(_) => return Err(WebError::InvalidInput("query must be a string".to_string())),
        };
        if query.is_empty() {
            return Err(WebError::InvalidInput("query must be non-empty".to_string()));
        }
        let max_results = match args.get("max_results") {
            None | Some(Value::Null) => self.default_max_results as i64,
            Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64().unwrap(),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| WebError::InvalidInput("max_results must be an integer".to_string()))?,
            Some(_) => {
                return Err(WebError::InvalidInput(
                    "max_results must be an integer".to_string(),
                ))
            }
        };
        if !(1..=10).contains(&max_results) {
            return Err(WebError::InvalidInput(
                "max_results must be between 1 and 10".to_string(),
            ));
        }

        let response = self
            .search_backend
            .search(&query, max_results as usize, self.timeout_ms)
            .await?;
        let normalized = normalize_search_items(&response.items, self.search_backend.backend_id());
        let truncated: Vec<Value> = normalized.iter().map(truncate_fields).collect();
        let mut out = json!({"items": truncated});
        if let Some(summary) = response.summary {
            out["summary"] = json!(summary);
        }
        Ok(out)
    }

    async fn invoke_fetch(&self, args: &Value, scope: InvokeScope<'_>) -> Result<Value, WebError> {
        let url = match args.get("url") {
            None | Some(Value::Null) => {
                return Err(WebError::InvalidInput("url is required".to_string()))
            }
            Some(Value::String(s)) => s.trim().to_string(),
            Some(_) => return Err(WebError::InvalidInput("url must be a string".to_string())),
        };
        if url.is_empty() {
            return Err(WebError::InvalidInput("url must be non-empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(WebError::InvalidInput(
                "url must be http:// or https://".to_string(),
            ));
        }
        let timeout_ms = match args.get("timeout_ms").and_then(|v| v.as_i64()) {
            Some(t) if (1000..=120_000).contains(&t) => t as u64,
            _ => self.fetch_timeout_ms,
        };
        let raw = self
            .fetch_backend
            .fetch(&url, timeout_ms, scope.artifact_dir)
            .await?;
        Ok(normalize_fetch_result(&raw))
    }
}

#[async_trait]
impl ToolProvider for WebProvider {
    fn provider_id(&self) -> &str {
        Self::PROVIDER_ID
    }

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError> {
        Ok(vec![
            ToolMeta {
                name: "web.search".to_string(),
                input_schema: serde_json::from_str(WEB_SEARCH_INPUT_SCHEMA).unwrap_or_default(),
                provider_id: Self::PROVIDER_ID.to_string(),
                risk_level: RiskLevel::ReadOnly,
                side_effects: false,
                capability_level: CapabilityLevel::L0,
                requires_confirm: false,
                timeout_ms: self.timeout_ms,
            },
            ToolMeta {
                name: "web.fetch".to_string(),
                input_schema: serde_json::from_str(WEB_FETCH_INPUT_SCHEMA).unwrap_or_default(),
                provider_id: Self::PROVIDER_ID.to_string(),
                risk_level: RiskLevel::ReadOnly,
                side_effects: false,
                capability_level: CapabilityLevel::L0,
                requires_confirm: false,
                timeout_ms: self.fetch_timeout_ms,
            },
        ])
    }

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        scope: InvokeScope<'_>,
        _llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "web.search" => Ok(self.invoke_search(args).await?),
            "web.fetch" => Ok(self.invoke_fetch(args, scope).await?),
            other => Err(ToolError::not_found(
                other,
                "WebProvider only supports web.search and web.fetch",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::web_backends::fetch_stub::StubWebFetchBackend;
    use crate::tools::web_backends::stub::StubWebSearchBackend;
    use ferrite_types::ErrorCode;

    fn provider() -> WebProvider {
        WebProvider::new(
            Box::new(StubWebSearchBackend),
            Box::new(StubWebFetchBackend),
            DEFAULT_WEB_SEARCH_TIMEOUT_MS,
            None,
        )
    }

    fn scope() -> InvokeScope<'static> {
        InvokeScope {
            run_id: "r1",
            conversation_id: None,
            artifact_dir: None,
        }
    }

    #[test]
    fn normalization_drops_bad_urls_and_ranks_survivors() {
        let raw = vec![
            json!({"title": "good", "url": "https://a.example", "snippet": "s"}),
            json!({"title": "no url"}),
            json!({"title": "bad scheme", "url": "ftp://x"}),
            json!({"title": 42, "url": "https://b.example", "snippet": 7}),
            json!("not an object"),
        ];
        let items = normalize_search_items(&raw, "stub");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["rank"], 1);
        // rank reflects position in the raw list
        assert_eq!(items[1]["rank"], 4);
        assert_eq!(items[1]["title"], "42");
        assert_eq!(items[1]["snippet"], "7");
        assert_eq!(items[0]["provider"], "stub");
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = vec![json!({"title": "t", "url": "https://a.example", "snippet": "s"})];
        let once = normalize_search_items(&raw, "stub");
        let twice = normalize_search_items(&once, "stub");
        assert_eq!(once, twice);
    }

    #[test]
    fn truncation_caps_every_field() {
        let item = json!({
            "title": "t".repeat(600),
            "url": format!("https://a.example/{}", "u".repeat(3000)),
            "snippet": "s".repeat(5000),
            "provider": "p".repeat(100),
            "rank": 3,
        });
        let out = truncate_fields(&item);
        assert_eq!(out["title"].as_str().unwrap().len(), TITLE_MAX);
        assert_eq!(out["url"].as_str().unwrap().len(), URL_MAX);
        assert_eq!(out["snippet"].as_str().unwrap().len(), SNIPPET_MAX);
        assert_eq!(out["provider"].as_str().unwrap().len(), PROVIDER_MAX);
        assert_eq!(out["rank"], 3);
    }

    #[tokio::test]
    async fn search_validates_inputs() {
        let p = provider();
        for args in [
            json!({}),
            json!({"query": ""}),
            json!({"query": "  "}),
            json!({"query": 5}),
            json!({"query": "x", "max_results": 0}),
            json!({"query": "x", "max_results": 11}),
        ] {
            let err = p.invoke("web.search", &args, scope(), None).await.unwrap_err();
            assert_eq!(err.code(), "InvalidInput", "args: {args}");
        }
    }

    #[tokio::test]
    async fn search_returns_normalized_ranked_items() {
        let p = provider();
        let out = p
            .invoke("web.search", &json!({"query": "rust", "max_results": 3}), scope(), None)
            .await
            .unwrap();
        let items = out["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item["rank"], (i + 1) as i64);
            assert_eq!(item["provider"], "stub");
        }
    }

    #[tokio::test]
    async fn fetch_normalizes_canonical_shape() {
        let p = provider();
        let out = p
            .invoke("web.fetch", &json!({"url": "https://example.com"}), scope(), None)
            .await
            .unwrap();
        assert_eq!(out["status_code"], 200);
        assert_eq!(out["truncated"], false);
        assert!(out["text"].as_str().is_some());

        let err = p
            .invoke("web.fetch", &json!({"url": "ftp://x"}), scope(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[tokio::test]
    async fn out_of_range_fetch_timeout_falls_back_to_default() {
        let p = provider();
        // would fail loudly if the provider forwarded 5ms as-is and the
        // backend cared; the stub just echoes success
        let out = p
            .invoke(
                "web.fetch",
                &json!({"url": "https://example.com", "timeout_ms": 5}),
                scope(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out["status_code"], 200);
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_not_found() {
        let p = provider();
        let err = p
            .invoke("web.translate", &json!({}), scope(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ToolNotFound");
    }
}
