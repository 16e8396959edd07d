use regex::Regex;
use std::sync::OnceLock;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"))
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("ws regex"))
}

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("script regex")
    })
}

/// Decode the handful of entities search pages actually use.
pub fn unescape_entities(input: &str) -> String {
    input
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

/// Drop tags and collapse whitespace; entities decoded afterwards so
/// `&lt;tag&gt;` text survives.
pub fn strip_tags(input: &str) -> String {
    let without = tag_re().replace_all(input, " ");
    let collapsed = ws_re().replace_all(&without, " ");
    unescape_entities(collapsed.trim())
}

/// Visible page text: script/style removed first, then tags.
pub fn visible_text(html: &str) -> String {
    let cleaned = script_style_re().replace_all(html, " ");
    strip_tags(&cleaned)
}

/// First `<title>` contents, stripped.
pub fn page_title(html: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_tags(m.as_str()))
        .unwrap_or_default()
}
