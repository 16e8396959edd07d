mod snapshot;
mod store;

pub use snapshot::{compute_facts_snapshot_id, format_facts_block};
pub use store::FactsStore;

use std::collections::BTreeMap;

use ferrite_types::Fact;

/// Default cap on the merged active set, so a large global backlog cannot
/// bloat prompts or envelopes.
pub const DEFAULT_ACTIVE_FACTS_LIMIT: usize = 100;

/// Where an active-facts fetch actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactsSource {
    Provided,
    Store,
    FallbackZero,
}

impl FactsSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FactsSource::Provided => "provided",
            FactsSource::Store => "store",
            FactsSource::FallbackZero => "fallback_zero",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse failure class used in fallback logging.
fn classify_error(err: &MemoryError) -> &'static str {
    match err {
        MemoryError::Database(_) => "db",
        MemoryError::Serialization(_) => "serialization",
        MemoryError::Http(_) => "unknown",
    }
}

/// Merge facts by key with `session` overriding `global`, keeping only the
/// active set, stably sorted by `(key, id)` and truncated to `limit`.
pub fn merge_active_facts(
    global_facts: Vec<Fact>,
    session_facts: Vec<Fact>,
    limit: usize,
) -> Vec<Fact> {
    let mut by_key: BTreeMap<String, Fact> = BTreeMap::new();
    for fact in global_facts.into_iter().chain(session_facts) {
        if fact.is_active() {
            by_key.insert(fact.key.clone(), fact);
        }
    }
    let mut ordered: Vec<Fact> = by_key.into_values().collect();
    ordered.sort_by(|a, b| (a.key.as_str(), a.id.as_str()).cmp(&(b.key.as_str(), b.id.as_str())));
    ordered.truncate(limit);
    ordered
}

/// Fetch the merged active set from the in-process store. Never partial: any
/// failure is classified, logged, and degraded to `([], fallback_zero)`.
pub async fn fetch_active_facts(
    store: &FactsStore,
    conversation_id: Option<&str>,
    limit: Option<usize>,
) -> (Vec<Fact>, FactsSource) {
    let limit = limit.unwrap_or(DEFAULT_ACTIVE_FACTS_LIMIT);
    match fetch_active_facts_inner(store, conversation_id, limit).await {
        Ok(facts) => (facts, FactsSource::Store),
        Err(err) => {
            tracing::error!(
                error_type = classify_error(&err),
                error = %err,
                conversation_id = conversation_id.unwrap_or(""),
                "memory.list_facts.error"
            );
            (Vec::new(), FactsSource::FallbackZero)
        }
    }
}

async fn fetch_active_facts_inner(
    store: &FactsStore,
    conversation_id: Option<&str>,
    limit: usize,
) -> Result<Vec<Fact>, MemoryError> {
    let global_facts = store.list_facts("global", "active", None).await?;
    let session_facts = match conversation_id {
        Some(session_id) => store.list_facts("session", "active", Some(session_id)).await?,
        None => Vec::new(),
    };
    Ok(merge_active_facts(global_facts, session_facts, limit))
}

/// HTTP fallback used when no store is reachable in-process.
pub struct MemoryHttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl MemoryHttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn list_facts(
        &self,
        scope: &str,
        status: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<Fact>, MemoryError> {
        let mut request = self
            .client
            .get(format!("{}/memory/facts", self.base_url))
            .query(&[("scope", scope), ("status", status)]);
        if let Some(session_id) = session_id {
            request = request.query(&[("session_id", session_id)]);
        }
        let facts: Vec<Fact> = request.send().await?.error_for_status()?.json().await?;
        Ok(facts)
    }

    pub async fn fetch_active_facts(
        &self,
        conversation_id: Option<&str>,
        limit: Option<usize>,
    ) -> (Vec<Fact>, FactsSource) {
        let limit = limit.unwrap_or(DEFAULT_ACTIVE_FACTS_LIMIT);
        let global_facts = match self.list_facts("global", "active", None).await {
            Ok(facts) => facts,
            Err(err) => {
                tracing::error!(error = %err, "memory.list_facts.http_error");
                return (Vec::new(), FactsSource::FallbackZero);
            }
        };
        let session_facts = match conversation_id {
            Some(session_id) => self
                .list_facts("session", "active", Some(session_id))
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };
        (
            merge_active_facts(global_facts, session_facts, limit),
            FactsSource::Store,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(id: &str, key: &str, value: serde_json::Value, scope: &str) -> Fact {
        Fact {
            id: id.to_string(),
            key: key.to_string(),
            value,
            status: "active".to_string(),
            scope: scope.to_string(),
            session_id: None,
            project_id: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn session_overrides_global_by_key() {
        let merged = merge_active_facts(
            vec![fact("g1", "lang", json!("en"), "global"), fact("g2", "likes", json!("cats"), "global")],
            vec![fact("s1", "lang", json!("zh-CN"), "session")],
            100,
        );
        assert_eq!(merged.len(), 2);
        let lang = merged.iter().find(|f| f.key == "lang").unwrap();
        assert_eq!(lang.value, json!("zh-CN"));
        assert_eq!(lang.id, "s1");
    }

    #[test]
    fn merge_sorts_by_key_then_id_and_truncates() {
        let merged = merge_active_facts(
            vec![
                fact("b", "zeta", json!(1), "global"),
                fact("a", "alpha", json!(2), "global"),
                fact("c", "mid", json!(3), "global"),
            ],
            vec![],
            2,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "alpha");
        assert_eq!(merged[1].key, "mid");
    }

    #[test]
    fn inactive_facts_are_dropped() {
        let mut retracted = fact("r1", "old", json!("gone"), "global");
        retracted.status = "retracted".to_string();
        let merged = merge_active_facts(vec![retracted], vec![], 100);
        assert!(merged.is_empty());
    }
}
