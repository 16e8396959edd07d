mod conversations;
mod execs;
mod runs;
mod settings;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

pub use conversations::{Conversation, Message};
pub use execs::SandboxExecRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Single source of truth for runs, conversations, messages, and the DB
/// settings layer. All lifecycle mutations are single-statement conditional
/// updates; nothing in memory is authoritative across workers.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn).await
    }

    /// In-memory store for tests and the stub deployment mode.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                title TEXT,
                status TEXT NOT NULL,
                conversation_id TEXT,
                input_json TEXT NOT NULL,
                output_json TEXT,
                error TEXT,
                progress INTEGER,
                attempt INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                lease_expires_at INTEGER,
                parent_run_id TEXT,
                canceled_at INTEGER,
                canceled_by TEXT,
                cancel_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_status_updated
             ON runs(status, updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                run_id TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Self::init_execs_schema(&conn)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
