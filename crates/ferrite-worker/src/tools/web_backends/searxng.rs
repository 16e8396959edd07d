use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{cap_results, clip, SearchResponse, WebError, WebSearchBackend};

const PROVIDER_MAX: usize = 64;

/// Map a SearXNG JSON payload to raw items. Structural surprises raise
/// `WebParseError`; individual bad rows are skipped.
pub fn parse_searxng_json(data: &Value) -> Result<Vec<Value>, WebError> {
    let Some(obj) = data.as_object() else {
        return Err(WebError::Parse("Response is not a JSON object".to_string()));
    };
    let Some(results) = obj.get("results").and_then(|v| v.as_array()) else {
        return Err(WebError::Parse(
            "Missing or invalid 'results' array".to_string(),
        ));
    };
    let mut out = Vec::new();
    for item in results {
        let Some(item) = item.as_object() else {
            continue;
        };
        let url = item.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            continue;
        }
        let as_text = |key: &str| -> String {
            match item.get(key) {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        };
        let engine = as_text("engine");
        let provider: String = if engine.is_empty() {
            "searxng".to_string()
        } else {
            engine.chars().take(PROVIDER_MAX).collect()
        };
        out.push(json!({
            "title": as_text("title"),
            "url": url,
            "snippet": as_text("content"),
            "provider": provider,
        }));
    }
    Ok(out)
}

/// Self-hosted SearXNG JSON API backend.
pub struct SearxngBackend {
    base_url: String,
    engines: Option<String>,
    categories: Option<String>,
    language: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SearxngBackend {
    pub fn new(
        base_url: &str,
        engines: Option<String>,
        categories: Option<String>,
        language: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            engines,
            categories,
            language,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WebSearchBackend for SearxngBackend {
    fn backend_id(&self) -> &str {
        "searxng"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<SearchResponse, WebError> {
        let mut request = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query.trim()), ("format", "json")])
            .timeout(Duration::from_millis(timeout_ms.max(1000)));
        if let Some(engines) = &self.engines {
            request = request.query(&[("engines", engines.as_str())]);
        }
        if let Some(categories) = &self.categories {
            request = request.query(&[("categories", categories.as_str())]);
        }
        if let Some(language) = &self.language {
            request = request.query(&[("language", language.as_str())]);
        }
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                WebError::Timeout(clip(&err))
            } else {
                WebError::Network(clip(&err))
            }
        })?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(WebError::Auth(format!("HTTP {status}")));
        }
        if (500..600).contains(&status) {
            return Err(WebError::BadGateway(format!("HTTP {status}")));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|err| WebError::Parse(clip(&err)))?;
        let items = parse_searxng_json(&data)?;
        Ok(SearchResponse::from_items(
            items.into_iter().take(cap_results(max_results)).collect(),
        ))
    }
}
