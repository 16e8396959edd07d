use serde_json::Value;
use sha2::{Digest, Sha256};

use ferrite_types::Fact;

/// JSON with recursively sorted object keys and compact separators, matching
/// the canonical form every component hashes.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[*k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Stable string form of a fact value for hashing: objects/arrays canonical
/// JSON, null the empty string, everything else its plain rendering.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => canonical_json(value),
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Content-based snapshot id over the active set.
///
/// Order independent: only `status == "active"` facts with a non-empty key
/// participate, sorted by `(id, key)`, and the canonical form keeps only the
/// stable fields `id`, `key`, `value`. Volatile fields (timestamps, source
/// refs, confidence) never enter the hash. Returns 64 hex chars.
pub fn compute_facts_snapshot_id(facts: &[Fact]) -> String {
    let mut active: Vec<&Fact> = facts.iter().filter(|f| f.is_active()).collect();
    active.sort_by(|a, b| (a.id.as_str(), a.key.as_str()).cmp(&(b.id.as_str(), b.key.as_str())));
    let canonical_list = active
        .iter()
        .map(|f| {
            format!(
                "{{\"id\":{},\"key\":{},\"value\":{}}}",
                serde_json::to_string(&f.id).unwrap_or_default(),
                serde_json::to_string(&f.key).unwrap_or_default(),
                serde_json::to_string(&canonical_value(&f.value)).unwrap_or_default(),
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    let canonical = format!("[{canonical_list}]");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Render the active facts as the system-message block shared by summarize
/// and the orchestrator prompt path. Empty string when nothing is active.
pub fn format_facts_block(facts: &[Fact]) -> String {
    let mut lines = Vec::new();
    for fact in facts {
        if !fact.is_active() {
            continue;
        }
        let rendered = match &fact.value {
            Value::Object(_) | Value::Array(_) => canonical_json(&fact.value),
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!("- {}: {}", fact.key, rendered));
    }
    if lines.is_empty() {
        return String::new();
    }
    format!(
        "The following are known facts about the user.\n\
         You MUST use them when relevant and MUST NOT ask the user for information already stated here.\n\n\
         [KNOWN FACTS]\n{}\n[/KNOWN FACTS]\n\n\
         Rules:\n\
         - Use KNOWN FACTS when relevant.\n\
         - Do not ask for info already in KNOWN FACTS.\n\
         - If user contradicts a fact, acknowledge and do not argue.\n",
        lines.join("\n")
    )
}
