use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use ferrite_types::ToolMeta;

use crate::tools::builtin::{BuiltinProvider, StubProvider};
use crate::tools::skills_provider::SkillsProvider;
use crate::tools::web_backends::baidu::BaiduBackend;
use crate::tools::web_backends::bocha::BochaBackend;
use crate::tools::web_backends::ddg_html::DdgHtmlBackend;
use crate::tools::web_backends::fetch_stub::StubWebFetchBackend;
use crate::tools::web_backends::http_fetch::HttpFetchBackend;
use crate::tools::web_backends::searxng::SearxngBackend;
use crate::tools::web_backends::stub::StubWebSearchBackend;
use crate::tools::web_backends::{WebFetchBackend, WebSearchBackend};
use crate::tools::web_provider::{WebProvider, DEFAULT_WEB_SEARCH_TIMEOUT_MS};
use crate::tools::webfetch::cache::WebFetchCache;
use crate::tools::webfetch::client::DEFAULT_MAX_BYTES;
use crate::tools::ToolProvider;

/// Name → provider resolution with a preferred order, so a configured real
/// backend shadows the stub uniformly. Per-provider tool lists are built
/// lazily, cached, and degrade silently to empty on listing failure.
pub struct ToolCatalog {
    providers: Vec<(String, Arc<dyn ToolProvider>)>,
    preferred_order: Vec<String>,
    cache: RwLock<HashMap<String, Vec<ToolMeta>>>,
}

impl ToolCatalog {
    pub fn new(preferred_order: Vec<String>) -> Self {
        Self {
            providers: Vec::new(),
            preferred_order,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn ToolProvider>) {
        self.providers
            .push((provider.provider_id().to_string(), provider));
    }

    pub fn get_provider(&self, provider_id: &str) -> Option<Arc<dyn ToolProvider>> {
        self.providers
            .iter()
            .find(|(id, _)| id == provider_id)
            .map(|(_, provider)| provider.clone())
    }

    /// Preferred order first, then remaining providers in registration
    /// order.
    fn resolution_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .preferred_order
            .iter()
            .filter(|id| self.providers.iter().any(|(pid, _)| pid == *id))
            .cloned()
            .collect();
        for (id, _) in &self.providers {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        order
    }

    async fn tools_for(&self, provider_id: &str) -> Vec<ToolMeta> {
        if let Some(cached) = self.cache.read().await.get(provider_id) {
            return cached.clone();
        }
        let Some(provider) = self.get_provider(provider_id) else {
            return Vec::new();
        };
        let tools = match provider.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                tracing::warn!(provider_id, error = %err, "tool listing failed, treating as empty");
                Vec::new()
            }
        };
        self.cache
            .write()
            .await
            .insert(provider_id.to_string(), tools.clone());
        tools
    }

    /// Resolve a tool name to its metadata via the earliest provider in the
    /// resolution order that exposes it.
    pub async fn get(&self, name: &str) -> Option<ToolMeta> {
        for provider_id in self.resolution_order() {
            if let Some(meta) = self
                .tools_for(&provider_id)
                .await
                .into_iter()
                .find(|meta| meta.name == name)
            {
                return Some(meta);
            }
        }
        None
    }

    /// All visible tools, deduplicated by name with resolution-order
    /// preference.
    pub async fn list_tools(&self) -> Vec<ToolMeta> {
        let mut seen: HashMap<String, ToolMeta> = HashMap::new();
        let mut names_in_order: Vec<String> = Vec::new();
        for provider_id in self.resolution_order() {
            for meta in self.tools_for(&provider_id).await {
                if !seen.contains_key(&meta.name) {
                    names_in_order.push(meta.name.clone());
                    seen.insert(meta.name.clone(), meta);
                }
            }
        }
        names_in_order
            .into_iter()
            .filter_map(|name| seen.remove(&name))
            .collect()
    }

    pub async fn invalidate_cache(&self) {
        self.cache.write().await.clear();
    }

    pub async fn close_providers(&self) {
        for (_, provider) in &self.providers {
            provider.close().await;
        }
    }
}

fn settings_str<'a>(settings: &'a Value, pointer: &str) -> Option<&'a str> {
    settings
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn search_backend_from_settings(settings: &Value) -> Box<dyn WebSearchBackend> {
    let backend = settings_str(settings, "/web/search/backend").unwrap_or("stub");
    match backend {
        "ddg_html" => Box::new(DdgHtmlBackend::new()),
        "baidu" => Box::new(BaiduBackend::new()),
        "searxng" => match settings_str(settings, "/web/search/searxng/base_url") {
            Some(base_url) => Box::new(SearxngBackend::new(
                base_url,
                settings_str(settings, "/web/search/searxng/engines").map(ToString::to_string),
                settings_str(settings, "/web/search/searxng/categories").map(ToString::to_string),
                settings_str(settings, "/web/search/searxng/language").map(ToString::to_string),
                settings_str(settings, "/web/search/searxng/api_key").map(ToString::to_string),
            )),
            None => {
                tracing::warn!("searxng backend selected without base_url, using stub");
                Box::new(StubWebSearchBackend)
            }
        },
        "bocha" => match settings_str(settings, "/web/search/bocha/api_key") {
            Some(api_key) => Box::new(BochaBackend::new(
                api_key,
                settings_str(settings, "/web/search/bocha/base_url"),
            )),
            None => {
                tracing::warn!("bocha backend selected without api_key, using stub");
                Box::new(StubWebSearchBackend)
            }
        },
        "stub" => Box::new(StubWebSearchBackend),
        other => {
            tracing::warn!(backend = other, "unknown web search backend, using stub");
            Box::new(StubWebSearchBackend)
        }
    }
}

fn fetch_backend_from_settings(settings: &Value) -> Box<dyn WebFetchBackend> {
    let backend = settings_str(settings, "/web/fetch/backend").unwrap_or("stub");
    match backend {
        // `httpx` kept as a config synonym for compatibility with older
        // deployments
        "http" | "httpx" => {
            let max_bytes = settings
                .pointer("/web/fetch/max_bytes")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_BYTES);
            let cache = settings_str(settings, "/web/fetch/cache_dir")
                .and_then(|dir| WebFetchCache::open(std::path::Path::new(dir)).ok())
                .map(Arc::new);
            Box::new(HttpFetchBackend::new(
                max_bytes,
                settings_str(settings, "/web/fetch/proxy"),
                settings_str(settings, "/web/fetch/user_agent"),
                cache,
            ))
        }
        "stub" => Box::new(StubWebFetchBackend),
        other => {
            tracing::warn!(backend = other, "unknown web fetch backend, using stub");
            Box::new(StubWebFetchBackend)
        }
    }
}

/// Assemble the catalog a worker uses for one run, from an effective
/// settings document (usually the run's `settings_snapshot`).
pub fn build_catalog_from_settings(settings: &Value) -> ToolCatalog {
    let search_timeout = settings
        .pointer("/web/search/timeout_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_WEB_SEARCH_TIMEOUT_MS);
    let fetch_timeout = settings
        .pointer("/web/fetch/timeout_ms")
        .and_then(|v| v.as_u64());

    let mut catalog = ToolCatalog::new(vec![
        "web".to_string(),
        "skills".to_string(),
        "builtin".to_string(),
        "stub".to_string(),
    ]);
    catalog.register_provider(Arc::new(WebProvider::new(
        search_backend_from_settings(settings),
        fetch_backend_from_settings(settings),
        search_timeout,
        fetch_timeout,
    )));
    let skills_base = settings_str(settings, "/skills/base_url").unwrap_or("http://127.0.0.1:5173");
    let list_fallback = settings
        .pointer("/skills/list_fallback")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    catalog.register_provider(Arc::new(SkillsProvider::new(skills_base, list_fallback)));
    catalog.register_provider(Arc::new(BuiltinProvider));
    catalog.register_provider(Arc::new(StubProvider));
    catalog
}
