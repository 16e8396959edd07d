/// Query parameter names dropped during normalization. `utm_` matches by
/// prefix.
const TRACKING_PARAM_PREFIXES: [&str; 1] = ["utm_"];
const TRACKING_PARAM_NAMES: [&str; 2] = ["spm", "fbclid"];

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TRACKING_PARAM_NAMES.contains(&lower.as_str())
        || TRACKING_PARAM_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
}

/// Normalize a fetch URL: drop the fragment, strip tracking query params,
/// keep everything else byte-for-byte.
pub fn normalize_fetch_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let without_fragment = match trimmed.split_once('#') {
        Some((head, _)) => head,
        None => trimmed,
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };
    let Some(query) = query else {
        return without_fragment.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            if pair.is_empty() {
                return false;
            }
            let name = pair.split('=').next().unwrap_or(pair);
            !is_tracking_param(name)
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}
