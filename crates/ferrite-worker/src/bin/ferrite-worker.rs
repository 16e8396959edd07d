use std::path::PathBuf;
use std::sync::Arc;

use ferrite_memory::FactsStore;
use ferrite_providers::build_llm_from_env;
use ferrite_store::Store;
use ferrite_worker::{TaskRunner, Worker, WorkerConfig};

fn env_path(name: &str, fallback: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(fallback))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ferrite_observability::init_logging("worker");

    let db_path = env_path("FERRITE_DB", "ferrite.db");
    let memory_db_path = env_path("FERRITE_MEMORY_DB", "ferrite-memory.db");
    let docs_root = env_path("FERRITE_DOCS_ROOT", "workspace/docs");

    let store = Store::open(&db_path).await?;
    let facts = FactsStore::open(&memory_db_path).await.ok().map(Arc::new);
    if facts.is_none() {
        tracing::warn!("facts store unavailable; tasks will see fallback_zero facts");
    }
    let settings = store.effective_settings().await?;
    let config = WorkerConfig::from_settings(&settings);
    let llm = build_llm_from_env();

    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        facts,
        llm,
        settings,
        docs_root,
    ));
    let worker = Worker::new(store, runner, config);
    worker.run_forever().await;
    Ok(())
}
