use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::html::strip_tags;
use super::{cap_results, clip, SearchResponse, WebError, WebSearchBackend};
use crate::tools::webfetch::client::DEFAULT_USER_AGENT;

const BAIDU_SEARCH_URL: &str = "https://www.baidu.com/s";
/// Interstitial keywords that identify a verification wall.
const CAPTCHA_KEYWORDS: [&str; 2] = ["验证码", "安全验证"];

fn block_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<div[^>]*class="[^"]*(?:\bresult\b|\bc-container\b)[^"]*"[^>]*>"#)
            .expect("baidu block regex")
    })
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<h3[^>]*class="[^"]*\bt\b[^"]*"[^>]*>.*?<a[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("baidu title regex")
    })
}

fn abstract_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<div[^>]*class="[^"]*c-abstract[^"]*"[^>]*>(.*?)</div>"#)
            .expect("baidu abstract regex")
    })
}

fn body_indicates_captcha(text: &str) -> bool {
    CAPTCHA_KEYWORDS.iter().any(|kw| text.contains(kw))
}

/// Parse a Baidu SERP. Returns `(items, error_code)` where the error code
/// is `captcha_required` for verification walls and `parse_failed` for
/// empty or unrecognizable markup.
///
/// The page is first segmented into `.result` / `.c-container` blocks and
/// the title and abstract are extracted from within the same segment, so a
/// block without an abstract (ads, image cards) never shifts snippets onto
/// the wrong title.
pub fn parse_baidu_html(html: &str) -> (Vec<Value>, Option<&'static str>) {
    if html.trim().is_empty() {
        return (Vec::new(), Some("parse_failed"));
    }
    if body_indicates_captcha(html) {
        return (Vec::new(), Some("captcha_required"));
    }

    let block_starts: Vec<usize> = block_start_re().find_iter(html).map(|m| m.start()).collect();
    let mut items: Vec<Value> = Vec::new();
    for (i, &start) in block_starts.iter().enumerate() {
        let end = block_starts.get(i + 1).copied().unwrap_or(html.len());
        let segment = &html[start..end];
        let Some(caps) = title_re().captures(segment) else {
            continue;
        };
        let url = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let title = strip_tags(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
        if !(url.starts_with("http://") || url.starts_with("https://")) || title.is_empty() {
            continue;
        }
        let snippet = abstract_re()
            .captures(segment)
            .map(|caps| strip_tags(caps.get(1).map(|m| m.as_str()).unwrap_or("")))
            .unwrap_or_default();
        items.push(json!({
            "title": title,
            "url": url,
            "snippet": snippet,
        }));
    }
    if items.is_empty() {
        return (Vec::new(), Some("parse_failed"));
    }
    (items, None)
}

pub struct BaiduBackend {
    client: reqwest::Client,
}

impl BaiduBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for BaiduBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebSearchBackend for BaiduBackend {
    fn backend_id(&self) -> &str {
        "baidu"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<SearchResponse, WebError> {
        let response = self
            .client
            .get(BAIDU_SEARCH_URL)
            .query(&[("wd", query.trim())])
            .header("User-Agent", DEFAULT_USER_AGENT)
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
        let (items, error_code) = parse_baidu_html(&body);
        match error_code {
            Some("captcha_required") => Err(WebError::blocked(
                "Baidu verification wall",
                Some("captcha_required"),
            )),
            Some(code) => Err(WebError::Parse(code.to_string())),
            None => Ok(SearchResponse::from_items(
                items.into_iter().take(cap_results(max_results)).collect(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <div class="result c-container" id="1">
      <h3 class="t"><a href="https://www.rust-lang.org/zh-CN/" target="_blank">Rust <em>程序设计语言</em></a></h3>
      <div class="c-abstract">一门赋予每个人构建可靠软件能力的语言。</div>
    </div>
    <div class="result" id="2">
      <h3 class="t"><a href="https://doc.rust-lang.org/">Docs</a></h3>
    </div>
    "#;

    #[test]
    fn parses_result_containers() {
        let (items, error) = parse_baidu_html(SAMPLE);
        assert!(error.is_none());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "Rust 程序设计语言");
        assert_eq!(items[0]["url"], "https://www.rust-lang.org/zh-CN/");
        assert!(items[0]["snippet"].as_str().unwrap().contains("可靠软件"));
        assert_eq!(items[1]["snippet"], "");
    }

    #[test]
    fn missing_abstract_does_not_shift_snippets() {
        // middle block is an ad card with a title but no c-abstract
        let html = r#"
        <div class="result c-container">
          <h3 class="t"><a href="https://first.example/">First</a></h3>
          <div class="c-abstract">first snippet</div>
        </div>
        <div class="result">
          <h3 class="t"><a href="https://ad.example/">Sponsored</a></h3>
        </div>
        <div class="c-container">
          <h3 class="t"><a href="https://third.example/">Third</a></h3>
          <div class="c-abstract">third snippet</div>
        </div>
        "#;
        let (items, error) = parse_baidu_html(html);
        assert!(error.is_none());
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["snippet"], "first snippet");
        assert_eq!(items[1]["title"], "Sponsored");
        assert_eq!(items[1]["snippet"], "");
        assert_eq!(items[2]["title"], "Third");
        assert_eq!(items[2]["snippet"], "third snippet");
    }

    #[test]
    fn block_without_title_is_skipped() {
        let html = r#"
        <div class="c-container"><span>image card, no heading</span></div>
        <div class="result">
          <h3 class="t"><a href="https://only.example/">Only</a></h3>
          <div class="c-abstract">its snippet</div>
        </div>
        "#;
        let (items, error) = parse_baidu_html(html);
        assert!(error.is_none());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "Only");
        assert_eq!(items[0]["snippet"], "its snippet");
    }

    #[test]
    fn captcha_wall_is_detected() {
        let (items, error) = parse_baidu_html("<html>请输入验证码继续访问</html>");
        assert!(items.is_empty());
        assert_eq!(error, Some("captcha_required"));
        let (_, error) = parse_baidu_html("<html>安全验证</html>");
        assert_eq!(error, Some("captcha_required"));
    }

    #[test]
    fn unparseable_markup_is_parse_failed() {
        let (items, error) = parse_baidu_html("<html><body>nothing here</body></html>");
        assert!(items.is_empty());
        assert_eq!(error, Some("parse_failed"));
        let (_, error) = parse_baidu_html("");
        assert_eq!(error, Some("parse_failed"));
    }
}
