use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::html::strip_tags;
use super::{cap_results, clip, SearchResponse, WebError, WebSearchBackend};
use crate::tools::webfetch::client::DEFAULT_USER_AGENT;

const DDG_HTML_URL: &str = "https://html.duckduckgo.com/html/";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
/// Body keywords that mean the page is refusing us, matched lowercase.
const BLOCKED_KEYWORDS: [&str; 3] = ["captcha", "unusual traffic", "blocked"];

fn no_results_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)no\s+results").expect("no results regex"))
}

fn result_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a[^>]*class="[^"]*result__a[^"]*"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)
            .expect("result link regex")
    })
}

fn result_snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a[^>]*class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</a>"#)
            .expect("result snippet regex")
    })
}

pub(crate) fn body_indicates_blocked(text: &str) -> bool {
    let lower = text.to_lowercase();
    BLOCKED_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Resolve a DDG redirect link. `uddg=` targets are decoded; anything that
/// does not decode to http(s) stays as-is.
pub fn extract_target_url(raw_url: &str) -> String {
    let trimmed = raw_url.trim();
    let looks_like_redirect = trimmed.contains("duckduckgo.com/l/")
        || trimmed.starts_with("/l/")
        || trimmed.starts_with("//duckduckgo.com/l/");
    if !looks_like_redirect {
        return trimmed.to_string();
    }
    let Some(query) = trimmed.split_once('?').map(|(_, q)| q) else {
        return trimmed.to_string();
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("uddg=") {
            let decoded = percent_decode(value);
            if decoded.starts_with("http://") || decoded.starts_with("https://") {
                return decoded;
            }
            return trimmed.to_string();
        }
    }
    trimmed.to_string()
}

/// Parse a DDG HTML results page into `{title, url, snippet}` items.
pub fn parse_ddg_html(html: &str) -> Vec<Value> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let links: Vec<(String, String)> = result_link_re()
        .captures_iter(html)
        .map(|caps| {
            (
                extract_target_url(caps.get(1).map(|m| m.as_str()).unwrap_or("")),
                strip_tags(caps.get(2).map(|m| m.as_str()).unwrap_or("")),
            )
        })
        .collect();
    let snippets: Vec<String> = result_snippet_re()
        .captures_iter(html)
        .map(|caps| strip_tags(caps.get(1).map(|m| m.as_str()).unwrap_or("")))
        .collect();
    links
        .into_iter()
        .enumerate()
        .filter(|(_, (url, title))| !url.is_empty() || !title.is_empty())
        .map(|(i, (url, title))| {
            json!({
                "title": title,
                "url": url,
                "snippet": snippets.get(i).cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// DuckDuckGo HTML endpoint: no key, no JS, parsed from markup.
pub struct DdgHtmlBackend {
    client: reqwest::Client,
}

impl DdgHtmlBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DdgHtmlBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebSearchBackend for DdgHtmlBackend {
    fn backend_id(&self) -> &str {
        "ddg_html"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<SearchResponse, WebError> {
        let response = self
            .client
            .get(DDG_HTML_URL)
            .query(&[("q", query.trim())])
            .header("User-Agent", DEFAULT_USER_AGENT)
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .timeout(Duration::from_millis(timeout_ms.max(1000)))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    WebError::Timeout(clip(&err))
                } else {
                    WebError::Network(clip(&err))
                }
            })?;

        let status = response.status().as_u16();
        if status == 403 || status == 429 {
            return Err(WebError::blocked(
                format!("HTTP {status}"),
                Some(if status == 403 { "http_403" } else { "http_429" }),
            ));
        }
        let body = response.text().await.map_err(|err| WebError::Network(clip(&err)))?;
        if body_indicates_blocked(&body) {
            return Err(WebError::blocked(
                "Page indicates block or captcha",
                Some("captcha_required"),
            ));
        }

        let items = parse_ddg_html(&body);
        if items.is_empty() && !no_results_re().is_match(&body) {
            return Err(WebError::Parse(
                "No result blocks parsed and page is not 'no results'".to_string(),
            ));
        }
        Ok(SearchResponse::from_items(
            items.into_iter().take(cap_results(max_results)).collect(),
        ))
    }
}
