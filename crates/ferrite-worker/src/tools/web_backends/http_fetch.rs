use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{is_http_or_https, WebError, WebFetchBackend};
use crate::tools::webfetch::cache::WebFetchCache;
use crate::tools::webfetch::client::{WebfetchClient, DEFAULT_MAX_BYTES};
use crate::tools::webfetch::extractor::extract_html;

/// Real fetch backend: SSRF-checked streaming GET, extractor chain, and an
/// optional shared cache keyed by normalized URL. With an artifact
/// directory the page's raw/extracted/meta files are persisted there.
pub struct HttpFetchBackend {
    client: WebfetchClient,
    cache: Option<Arc<WebFetchCache>>,
}

impl HttpFetchBackend {
    pub fn new(
        max_bytes: usize,
        proxy: Option<&str>,
        user_agent: Option<&str>,
        cache: Option<Arc<WebFetchCache>>,
    ) -> Self {
        Self {
            client: WebfetchClient::new(
                Duration::from_secs(5),
                Duration::from_secs(20),
                max_bytes,
                proxy,
                user_agent,
            ),
            cache,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_BYTES, None, None, None)
    }

    async fn write_artifacts(
        dir: &Path,
        raw_bytes: &[u8],
        extracted_text: &str,
        meta: &Value,
    ) -> Option<Value> {
        tokio::fs::create_dir_all(dir).await.ok()?;
        let raw_path = dir.join("raw.html");
        let extracted_path = dir.join("extracted.txt");
        let meta_path = dir.join("meta.json");
        tokio::fs::write(&raw_path, raw_bytes).await.ok()?;
        tokio::fs::write(&extracted_path, extracted_text).await.ok()?;
        tokio::fs::write(&meta_path, serde_json::to_vec(meta).ok()?).await.ok()?;
        Some(json!({
            "raw": raw_path.to_string_lossy(),
            "extracted": extracted_path.to_string_lossy(),
            "meta": meta_path.to_string_lossy(),
        }))
    }
}

#[async_trait]
impl WebFetchBackend for HttpFetchBackend {
    fn backend_id(&self) -> &str {
        "http"
    }

    async fn fetch(
        &self,
        url: &str,
        _timeout_ms: u64,
        artifact_dir: Option<&Path>,
    ) -> Result<Value, WebError> {
        if !is_http_or_https(url) {
            return Err(WebError::InvalidInput(
                "url must be http:// or https://".to_string(),
            ));
        }
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(url).await {
                return Ok(hit);
            }
        }

        let raw = self.client.fetch(url).await?;
        match raw.error {
            Some("http_403") => {
                return Err(WebError::blocked("HTTP 403", Some("http_403")));
            }
            Some("http_429") => {
                return Err(WebError::blocked("HTTP 429", Some("http_429")));
            }
            _ => {}
        }

        let extracted = extract_html(&raw);
        let text = extracted
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut out = json!({
            "url": raw.url,
            "final_url": raw.final_url,
            "status_code": raw.status_code,
            "content_type": raw.content_type(),
            "text": text,
            "extracted_text": text,
            "truncated": raw.truncated,
            "bytes_read": raw.bytes_read,
        });
        for key in ["title", "extraction_method", "paragraphs_count"] {
            if let Some(value) = extracted.get(key) {
                out[key] = value.clone();
            }
        }

        if let Some(dir) = artifact_dir {
            let meta = json!({
                "url": out["url"],
                "final_url": out["final_url"],
                "status_code": out["status_code"],
                "content_type": out["content_type"],
                "truncated": out["truncated"],
                "bytes_read": out["bytes_read"],
                "title": out.get("title").cloned().unwrap_or(Value::Null),
                "extraction_method": out.get("extraction_method").cloned().unwrap_or(Value::Null),
            });
            if let Some(paths) = Self::write_artifacts(dir, &raw.body, &text, &meta).await {
                out["artifact_paths"] = paths;
            }
        }
        if let Some(cache) = &self.cache {
            if raw.status_code == 200 {
                let _ = cache.put(&raw.url, &out, &raw.body).await;
            }
        }
        Ok(out)
    }
}
