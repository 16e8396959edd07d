use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::tools::web_backends::html::{page_title, strip_tags, visible_text};
use crate::tools::webfetch::WebFetchRaw;

/// Which layer of the extractor chain produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Readability,
    Trafilatura,
    Fallback,
    None,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::Readability => "readability",
            ExtractionMethod::Trafilatura => "trafilatura",
            ExtractionMethod::Fallback => "fallback",
            ExtractionMethod::None => "none",
        }
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.contains("html")
        || matches!(
            ct.as_str(),
            "text/plain" | "application/xhtml+xml" | "application/xml" | "text/xml"
        )
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<p\b[^>]*>(.*?)</p>").expect("p regex"))
}

/// Body-text heuristic: gather `<p>` blocks with real content and keep the
/// page only when enough of them carry weight. Returns `None` when the page
/// has no usable paragraph structure.
fn extract_readability(html: &str) -> Option<(String, String)> {
    if html.trim().len() < 10 {
        return None;
    }
    let mut paragraphs: Vec<String> = Vec::new();
    for caps in paragraph_re().captures_iter(html) {
        let text = strip_tags(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
        if text.chars().count() >= 30 {
            paragraphs.push(text);
        }
    }
    if paragraphs.is_empty() {
        return None;
    }
    let body = paragraphs.join("\n\n");
    Some((body, page_title(html)))
}

/// Markdown-conversion fallback; always yields something for HTML input.
fn extract_fallback(html: &str) -> (String, String) {
    if html.trim().is_empty() {
        return (String::new(), String::new());
    }
    let markdown = html2md::parse_html(html);
    let text = markdown.trim().to_string();
    if text.is_empty() {
        return (visible_text(html), page_title(html));
    }
    (text, page_title(html))
}

/// Split extracted text into paragraphs on blank lines.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("para regex"));
    re.split(text.trim())
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Run the extractor chain over a raw fetch, selecting the first layer that
/// yields non-empty text. Non-HTML content types extract nothing and report
/// `unsupported_content_type`.
pub fn extract_html(raw: &WebFetchRaw) -> Value {
    let content_type = raw.content_type();
    if !is_html_content_type(&content_type) {
        return json!({
            "title": "",
            "extracted_text": "",
            "text": "",
            "extraction_method": ExtractionMethod::None.as_str(),
            "paragraphs_count": 0,
            "error": "unsupported_content_type",
        });
    }
    let html = raw.body_text();
    if html.trim().is_empty() {
        return json!({
            "title": "",
            "extracted_text": "",
            "text": "",
            "extraction_method": ExtractionMethod::Fallback.as_str(),
            "paragraphs_count": 0,
        });
    }

    let (text, mut title, method) = match extract_readability(&html) {
        Some((text, title)) => (text, title, ExtractionMethod::Readability),
        None => {
            let (text, title) = extract_fallback(&html);
            (text, title, ExtractionMethod::Fallback)
        }
    };
    if title.is_empty() {
        title = page_title(&html);
    }
    let paragraphs_count = split_paragraphs(&text).len();
    json!({
        "title": title,
        "extracted_text": text,
        "text": text,
        "extraction_method": method.as_str(),
        "paragraphs_count": paragraphs_count,
    })
}
