use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ferrite_memory::FactsStore;
use ferrite_server::{serve, AppState};
use ferrite_store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ferrite_observability::init_logging("server");

    let db_path = std::env::var("FERRITE_DB").unwrap_or_else(|_| "ferrite.db".to_string());
    let memory_db_path =
        std::env::var("FERRITE_MEMORY_DB").unwrap_or_else(|_| "ferrite-memory.db".to_string());
    let addr: SocketAddr = std::env::var("FERRITE_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:5173".to_string())
        .parse()?;
    let skills_root = std::env::var("SKILLS_ROOT")
        .or_else(|_| std::env::var("REPO_ROOT").map(|r| format!("{r}/skills")))
        .ok()
        .map(PathBuf::from);

    let store = Store::open(std::path::Path::new(&db_path)).await?;
    let facts = FactsStore::open(std::path::Path::new(&memory_db_path))
        .await
        .ok()
        .map(Arc::new);
    let state = AppState::new(store, facts, skills_root).await?;
    serve(state, addr).await
}
