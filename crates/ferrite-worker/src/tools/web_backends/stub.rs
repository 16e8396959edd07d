use async_trait::async_trait;
use serde_json::json;

use super::{cap_results, SearchResponse, WebError, WebSearchBackend};

/// Deterministic offline backend: a fixed 2-3 item result page.
pub struct StubWebSearchBackend;

#[async_trait]
impl WebSearchBackend for StubWebSearchBackend {
    fn backend_id(&self) -> &str {
        "stub"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        _timeout_ms: u64,
    ) -> Result<SearchResponse, WebError> {
        let q: String = query.chars().take(50).collect();
        let items = vec![
            json!({
                "title": format!("Stub result for: {q}"),
                "url": "https://example.com/stub/1",
                "snippet": "Stub snippet 1.",
                "provider": "stub",
            }),
            json!({
                "title": "Stub result 2",
                "url": "https://example.com/stub/2",
                "snippet": "Stub snippet 2.",
                "provider": "stub",
            }),
            json!({
                "title": "Stub result 3",
                "url": "https://example.com/stub/3",
                "snippet": "Stub snippet 3.",
                "provider": "stub",
            }),
        ];
        Ok(SearchResponse::from_items(
            items.into_iter().take(cap_results(max_results)).collect(),
        ))
    }
}
