use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{is_http_or_https, WebError, WebFetchBackend};

/// Offline fetch backend with a fixed canonical shape.
pub struct StubWebFetchBackend;

#[async_trait]
impl WebFetchBackend for StubWebFetchBackend {
    fn backend_id(&self) -> &str {
        "stub"
    }

    async fn fetch(
        &self,
        url: &str,
        _timeout_ms: u64,
        _artifact_dir: Option<&Path>,
    ) -> Result<Value, WebError> {
        if !is_http_or_https(url) {
            return Err(WebError::InvalidInput(
                "url must be http:// or https://".to_string(),
            ));
        }
        let trimmed = url.trim();
        Ok(json!({
            "url": trimmed,
            "status_code": 200,
            "content_type": "text/html",
            "text": format!("Stub content for {trimmed}"),
            "truncated": false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_types::ErrorCode;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let backend = StubWebFetchBackend;
        let err = backend.fetch("ftp://x", 1000, None).await.unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[tokio::test]
    async fn returns_canonical_shape() {
        let backend = StubWebFetchBackend;
        let out = backend
            .fetch("https://example.com/a", 1000, None)
            .await
            .unwrap();
        assert_eq!(out["status_code"], 200);
        assert_eq!(out["truncated"], false);
        assert!(out["text"].as_str().unwrap().contains("example.com/a"));
    }
}
