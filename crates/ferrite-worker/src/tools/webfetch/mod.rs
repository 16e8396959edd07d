pub mod cache;
pub mod client;
pub mod extractor;
pub mod ssrf;
pub mod url_utils;

use std::collections::HashMap;

use serde_json::{json, Value};

/// Fetcher-layer output: status, headers, body bytes, and read metadata.
/// Extraction happens in a later layer.
#[derive(Debug, Clone)]
pub struct WebFetchRaw {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Fine-grained fetch error code (`http_403`, `timeout_read`, ...)
    /// when the response is usable but degraded.
    pub error: Option<&'static str>,
    pub bytes_read: usize,
    pub truncated: bool,
}

impl WebFetchRaw {
    pub fn content_type(&self) -> String {
        self.headers
            .get("content-type")
            .cloned()
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Canonical dict compatible with the `web.fetch` contract.
    pub fn to_canonical(&self) -> Value {
        json!({
            "url": self.url,
            "final_url": self.final_url,
            "status_code": self.status_code,
            "content_type": self.content_type(),
            "text": self.body_text(),
            "truncated": self.truncated,
            "bytes_read": self.bytes_read,
        })
    }
}
