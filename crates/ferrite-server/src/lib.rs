mod http;
mod skills;

pub use http::{build_router, serve};
pub use skills::{SkillManifest, SkillService};

use std::sync::Arc;

use serde_json::Value;

use ferrite_memory::FactsStore;
use ferrite_providers::{build_llm_from_env, Llm};
use ferrite_sandbox::SandboxRunner;
use ferrite_store::Store;

/// Everything the HTTP layer needs, built once at startup and injected.
/// Tests construct their own.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub facts: Option<Arc<FactsStore>>,
    pub skills: Arc<SkillService>,
    pub sandbox: Arc<SandboxRunner>,
    pub llm: Arc<dyn Llm>,
    pub settings: Value,
}

impl AppState {
    pub async fn new(
        store: Store,
        facts: Option<Arc<FactsStore>>,
        skills_root: Option<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let settings = store.effective_settings().await?;
        let skills_root = skills_root.or_else(|| {
            settings
                .pointer("/skills/root")
                .and_then(|v| v.as_str())
                .map(std::path::PathBuf::from)
        });
        Ok(Self {
            store,
            facts,
            skills: Arc::new(SkillService::new(skills_root)),
            sandbox: Arc::new(SandboxRunner::new(settings.clone())),
            llm: build_llm_from_env(),
            settings,
        })
    }
}
