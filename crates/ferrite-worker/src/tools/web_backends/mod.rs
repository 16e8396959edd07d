pub mod baidu;
pub mod bocha;
pub mod ddg_html;
mod errors;
pub mod fetch_stub;
pub(crate) mod html;
pub mod http_fetch;
pub mod searxng;
pub mod stub;

pub use errors::WebError;
pub(crate) use errors::clip;

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

/// Raw search output before the provider normalizes it. `items` keep
/// whatever shape the upstream produced; normalization and truncation are
/// the provider's job, not the backend's.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub items: Vec<Value>,
    pub summary: Option<String>,
}

impl SearchResponse {
    pub fn from_items(items: Vec<Value>) -> Self {
        Self {
            items,
            summary: None,
        }
    }
}

#[async_trait]
pub trait WebSearchBackend: Send + Sync {
    /// e.g. `ddg_html`, `searxng`, `baidu`, `bocha`, `stub`.
    fn backend_id(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<SearchResponse, WebError>;
}

#[async_trait]
pub trait WebFetchBackend: Send + Sync {
    fn backend_id(&self) -> &str;

    /// Returns a raw fetch dict (`url`, `status_code`, `content_type`,
    /// `text`, `truncated`, plus extractor fields when available). With an
    /// `artifact_dir` the backend persists page artifacts and reports their
    /// paths.
    async fn fetch(
        &self,
        url: &str,
        timeout_ms: u64,
        artifact_dir: Option<&Path>,
    ) -> Result<Value, WebError>;
}

pub(crate) fn cap_results(max_results: usize) -> usize {
    max_results.clamp(1, 10)
}

pub(crate) fn is_http_or_https(url: &str) -> bool {
    let trimmed = url.trim();
    trimmed.starts_with("http://") || trimmed.starts_with("https://")
}
