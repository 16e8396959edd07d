use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{cap_results, clip, SearchResponse, WebError, WebSearchBackend};

pub const BOCHA_DEFAULT_BASE_URL: &str = "https://api.bochaai.com";

/// Locate the web results array. The official payload is Bing-compatible
/// (`webPages.value`); older and wrapped responses fall back through
/// `data.webPages.value`, `data.results/list/items`, `results`, `citations`.
fn extract_results_array(payload: &Value) -> Option<&Vec<Value>> {
    if let Some(values) = payload
        .get("webPages")
        .and_then(|wp| wp.get("value"))
        .and_then(|v| v.as_array())
    {
        return Some(values);
    }
    if let Some(data) = payload.get("data").and_then(|v| v.as_object()) {
        if let Some(values) = data
            .get("webPages")
            .and_then(|wp| wp.get("value"))
            .and_then(|v| v.as_array())
        {
            return Some(values);
        }
        for key in ["results", "list", "items"] {
            if let Some(values) = data.get(key).and_then(|v| v.as_array()) {
                return Some(values);
            }
        }
    }
    for key in ["results", "citations"] {
        if let Some(values) = payload.get(key).and_then(|v| v.as_array()) {
            return Some(values);
        }
    }
    None
}

fn is_valid_url(value: Option<&Value>) -> Option<&str> {
    let url = value?.as_str()?.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url)
    } else {
        None
    }
}

fn item_from_value(item: &Value) -> Option<Value> {
    let obj = item.as_object()?;
    let url = is_valid_url(obj.get("url").or_else(|| obj.get("link")).or_else(|| obj.get("href")))?;
    // Bing-compatible items carry the title under `name`
    let title = obj
        .get("name")
        .or_else(|| obj.get("title"))
        .map(|v| match v {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let snippet = ["snippet", "summary", "description", "content", "text"]
        .iter()
        .find_map(|key| obj.get(*key))
        .map(|v| match v {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let mut row = json!({
        "title": title,
        "url": url,
        "snippet": snippet,
        "provider": "bocha",
    });
    if let Some(published) = obj.get("datePublished").and_then(|v| v.as_str()) {
        if !published.trim().is_empty() {
            row["published_at"] = json!(published.trim());
        }
    }
    Some(row)
}

/// Parse a Bocha response to `{items, summary?}`.
pub fn parse_bocha_response(payload: &Value) -> Result<SearchResponse, WebError> {
    if !payload.is_object() {
        return Err(WebError::Parse("Response is not a JSON object".to_string()));
    }
    let summary = payload
        .get("summary")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let Some(raw_items) = extract_results_array(payload) else {
        let keys: Vec<&String> = payload.as_object().map(|o| o.keys().take(10).collect()).unwrap_or_default();
        return Err(WebError::Parse(format!(
            "Missing or invalid webPages.value/results/citations; response keys: {keys:?}"
        )));
    };
    let items = raw_items.iter().filter_map(item_from_value).collect();
    Ok(SearchResponse { items, summary })
}

/// A payload that parses but yields zero usable items is a hard parse
/// error, not a success and not retryable.
fn finalize_response(
    mut parsed: SearchResponse,
    count: usize,
) -> Result<SearchResponse, WebError> {
    if parsed.items.is_empty() {
        return Err(WebError::Parse("EmptyResult".to_string()));
    }
    parsed.items.truncate(count);
    Ok(parsed)
}

/// Bocha Web Search API: POST with a bearer key. Retries only on 5xx,
/// timeout, or transport failure; 401/403/429 fail immediately.
pub struct BochaBackend {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl BochaBackend {
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or(BOCHA_DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
            max_attempts: 3,
        }
    }
}

#[async_trait]
impl WebSearchBackend for BochaBackend {
    fn backend_id(&self) -> &str {
        "bocha"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<SearchResponse, WebError> {
        if self.api_key.trim().is_empty() {
            return Err(WebError::Auth("BOCHA_API_KEY is not set".to_string()));
        }
        let count = cap_results(max_results);
        let body = json!({"query": query.trim(), "summary": true, "count": count});
        let mut last_err: Option<WebError> = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            let result = self
                .client
                .post(format!("{}/v1/web-search", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .timeout(Duration::from_millis(timeout_ms.max(1000)))
                .send()
                .await;
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    let wrapped = if err.is_timeout() {
                        WebError::Timeout(clip(&err))
                    } else {
                        WebError::Network(clip(&err))
                    };
                    if attempt < self.max_attempts - 1 {
                        last_err = Some(wrapped);
                        continue;
                    }
                    return Err(wrapped);
                }
            };
            let status = response.status().as_u16();
            match status {
                401 | 403 => return Err(WebError::Auth(format!("HTTP {status}"))),
                429 => {
                    return Err(WebError::blocked(format!("HTTP {status}"), Some("http_429")))
                }
                500..=599 => {
                    let wrapped = WebError::BadGateway(format!("HTTP {status}"));
                    if attempt < self.max_attempts - 1 {
                        last_err = Some(wrapped);
                        continue;
                    }
                    return Err(wrapped);
                }
                _ => {}
            }
            let payload: Value = response
                .json()
                .await
                .map_err(|err| WebError::Parse(clip(&err)))?;
            let parsed = parse_bocha_response(&payload)?;
            return finalize_response(parsed, count);
        }
        Err(last_err.unwrap_or_else(|| WebError::Network("bocha search failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_types::ErrorCode;

    #[test]
    fn official_bing_compatible_shape_wins() {
        let payload = json!({
            "summary": "  What Rust is.  ",
            "webPages": {"value": [
                {"name": "Rust", "url": "https://rust-lang.org", "snippet": "A language", "datePublished": "2025-01-01"},
                {"name": "bad", "url": "notaurl"},
            ]},
            "results": [{"title": "ignored", "url": "https://old.example"}],
        });
        let parsed = parse_bocha_response(&payload).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0]["title"], "Rust");
        assert_eq!(parsed.items[0]["provider"], "bocha");
        assert_eq!(parsed.items[0]["published_at"], "2025-01-01");
        assert_eq!(parsed.summary.as_deref(), Some("What Rust is."));
    }

    #[test]
    fn wrapped_and_legacy_shapes_are_accepted() {
        let wrapped = json!({"data": {"webPages": {"value": [
            {"name": "W", "url": "https://w.example", "summary": "s"}
        ]}}});
        assert_eq!(parse_bocha_response(&wrapped).unwrap().items.len(), 1);

        let legacy = json!({"citations": [
            {"title": "C", "link": "https://c.example", "content": "body"}
        ]});
        let parsed = parse_bocha_response(&legacy).unwrap();
        assert_eq!(parsed.items[0]["snippet"], "body");
    }

    #[test]
    fn missing_results_is_a_parse_error() {
        let err = parse_bocha_response(&json!({"code": 200})).unwrap_err();
        assert_eq!(err.code(), "WebParseError");
    }

    #[test]
    fn zero_item_parse_is_empty_result_error() {
        let payload = json!({"webPages": {"value": []}});
        let parsed = parse_bocha_response(&payload).unwrap();
        let err = finalize_response(parsed, 5).unwrap_err();
        assert_eq!(err.code(), "WebParseError");
        assert_eq!(err.to_string(), "EmptyResult");

        // all items invalid also counts as empty
        let payload = json!({"webPages": {"value": [{"name": "x", "url": "notaurl"}]}});
        let parsed = parse_bocha_response(&payload).unwrap();
        assert!(finalize_response(parsed, 5).is_err());

        // a populated parse passes through and truncates
        let payload = json!({"webPages": {"value": [
            {"name": "a", "url": "https://a.example"},
            {"name": "b", "url": "https://b.example"},
        ]}});
        let parsed = parse_bocha_response(&payload).unwrap();
        let out = finalize_response(parsed, 1).unwrap();
        assert_eq!(out.items.len(), 1);
    }
}
