use rusqlite::{params, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::{now_ms, Store, StoreResult};

const SETTINGS_KEY: &str = "v0";

/// Deep merge `overlay` into `base`: objects merge recursively, everything
/// else is replaced by the overlay value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}

/// Lowest settings layer: the values every deployment starts from.
pub fn default_settings() -> Value {
    json!({
        "version": "settings_v0",
        "run": {
            "lease_seconds": 60,
            "heartbeat_seconds": 20,
            "poll_seconds": 1,
            "max_attempts": 3,
        },
        "web": {
            "search": {
                "backend": "stub",
                "timeout_ms": 15000,
            },
            "fetch": {
                "backend": "stub",
                "timeout_ms": 15000,
                "max_bytes": 5 * 1024 * 1024,
                "user_agent": "Mozilla/5.0 (compatible; Ferrite/1.0; +https://github.com/ferrite-dev/ferrite)",
            },
        },
        "skills": {
            "base_url": "http://127.0.0.1:5173",
            "list_fallback": false,
        },
        "agent_loop": {
            "enabled": true,
            "max_steps": 3,
            "decision_timeout_seconds": 30,
            "allowed_run_types": [
                "sleep",
                "summarize_conversation",
                "research_report",
                "run_code_snippet",
                "edit_docs_propose",
                "edit_docs_apply",
                "edit_docs_cancel",
            ],
        },
        "sandbox": {
            "runtime_mode": "auto",
            "workspace_root_win": "",
            "workspace_root_wsl": "",
            "docker": {"cli_path": "docker", "image": "ferrite-sandbox:py312"},
        },
    })
}

fn set_path(out: &mut Map<String, Value>, path: &[&str], value: Value) {
    debug_assert!(!path.is_empty());
    if path.len() == 1 {
        out.insert(path[0].to_string(), value);
        return;
    }
    let entry = out
        .entry(path[0].to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = entry {
        set_path(map, &path[1..], value);
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_i64(name: &str) -> Option<i64> {
    env_str(name).and_then(|v| v.parse().ok())
}

/// Middle layer: recognized environment overrides. Unknown values log and
/// fall back (unset keys simply do not appear here).
pub fn env_settings() -> Value {
    let mut out = Map::new();
    if let Some(v) = env_i64("RUN_LEASE_SECONDS") {
        set_path(&mut out, &["run", "lease_seconds"], json!(v.max(1)));
    }
    if let Some(v) = env_i64("RUN_HEARTBEAT_SECONDS") {
        set_path(&mut out, &["run", "heartbeat_seconds"], json!(v.max(1)));
    }
    if let Some(v) = env_i64("RUN_POLL_SECONDS") {
        set_path(&mut out, &["run", "poll_seconds"], json!(v.max(1)));
    }
    if let Some(v) = env_i64("RUN_MAX_ATTEMPTS") {
        set_path(&mut out, &["run", "max_attempts"], json!(v.max(1)));
    }
    if let Some(backend) = env_str("WEB_SEARCH_BACKEND") {
        let backend = backend.to_ascii_lowercase();
        match backend.as_str() {
            "stub" | "ddg_html" | "searxng" | "baidu" | "bocha" => {
                set_path(&mut out, &["web", "search", "backend"], json!(backend));
            }
            other => {
                tracing::warn!(backend = other, "unknown WEB_SEARCH_BACKEND, using stub");
                set_path(&mut out, &["web", "search", "backend"], json!("stub"));
            }
        }
    }
    if let Some(v) = env_i64("WEB_SEARCH_TIMEOUT_MS") {
        set_path(&mut out, &["web", "search", "timeout_ms"], json!(v.max(1000)));
    }
    if let Some(url) = env_str("SEARXNG_BASE_URL") {
        set_path(&mut out, &["web", "search", "searxng", "base_url"], json!(url));
    }
    if let Some(key) = env_str("BOCHA_API_KEY") {
        set_path(&mut out, &["web", "search", "bocha", "api_key"], json!(key));
    }
    if let Some(backend) = env_str("WEB_FETCH_BACKEND") {
        let backend = backend.to_ascii_lowercase();
        match backend.as_str() {
            // `httpx` accepted as a legacy synonym for the http backend
            "stub" | "http" | "httpx" => {
                set_path(&mut out, &["web", "fetch", "backend"], json!(backend));
            }
            other => {
                tracing::warn!(backend = other, "unknown WEB_FETCH_BACKEND, using stub");
                set_path(&mut out, &["web", "fetch", "backend"], json!("stub"));
            }
        }
    }
    if let Some(v) = env_i64("WEB_FETCH_TIMEOUT_MS") {
        set_path(&mut out, &["web", "fetch", "timeout_ms"], json!(v.max(1000)));
    }
    if let Some(v) = env_i64("WEB_FETCH_MAX_BYTES") {
        set_path(&mut out, &["web", "fetch", "max_bytes"], json!(v.max(1024)));
    }
    if let Some(ua) = env_str("WEB_FETCH_USER_AGENT") {
        set_path(&mut out, &["web", "fetch", "user_agent"], json!(ua));
    }
    if let Some(proxy) = env_str("WEB_FETCH_PROXY") {
        set_path(&mut out, &["web", "fetch", "proxy"], json!(proxy));
    }
    if let Some(root) = env_str("SKILLS_ROOT").or_else(|| env_str("REPO_ROOT")) {
        set_path(&mut out, &["skills", "root"], json!(root));
    }
    if let Some(flag) = env_str("SKILLS_LIST_FALLBACK") {
        set_path(&mut out, &["skills", "list_fallback"], json!(flag == "1"));
    }
    if let Some(flag) = env_str("AGENT_LOOP_ENABLED") {
        let enabled = !matches!(flag.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no");
        set_path(&mut out, &["agent_loop", "enabled"], json!(enabled));
    }
    if let Some(types) = env_str("AGENT_ALLOWED_RUN_TYPES") {
        let list: Vec<String> = types
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !list.is_empty() {
            set_path(&mut out, &["agent_loop", "allowed_run_types"], json!(list));
        }
    }
    if let Some(v) = env_i64("AGENT_DECISION_TIMEOUT_SECONDS") {
        set_path(
            &mut out,
            &["agent_loop", "decision_timeout_seconds"],
            json!(v.max(1)),
        );
    }
    Value::Object(out)
}

impl Store {
    /// DB settings layer only; writes never touch defaults or env.
    pub async fn put_settings(&self, value: &Value) -> StoreResult<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = ?2, updated_at = ?3",
            params![SETTINGS_KEY, serde_json::to_string(value)?, now_ms()],
        )?;
        Ok(())
    }

    pub async fn get_settings_db(&self) -> StoreResult<Option<Value>> {
        let conn = self.conn().lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// Effective settings: defaults < env < DB. Runs created while this
    /// snapshot is current embed it as `settings_snapshot` so execution stays
    /// reproducible even if settings change afterwards.
    pub async fn effective_settings(&self) -> StoreResult<Value> {
        let mut merged = default_settings();
        deep_merge(&mut merged, &env_settings());
        if let Some(db_layer) = self.get_settings_db().await? {
            deep_merge(&mut merged, &db_layer);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_prefers_overlay_scalars_and_merges_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let overlay = json!({"a": {"b": 9}, "e": 4});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"a": {"b": 9, "c": 2}, "d": 3, "e": 4}));
    }

    #[tokio::test]
    async fn db_layer_overrides_defaults() {
        let store = Store::open_in_memory().await.unwrap();
        let effective = store.effective_settings().await.unwrap();
        assert_eq!(effective["web"]["search"]["backend"], "stub");
        store
            .put_settings(&json!({"web": {"search": {"backend": "searxng"}}}))
            .await
            .unwrap();
        let effective = store.effective_settings().await.unwrap();
        assert_eq!(effective["web"]["search"]["backend"], "searxng");
        // untouched defaults survive the merge
        assert_eq!(effective["web"]["fetch"]["timeout_ms"], 15000);
    }
}
