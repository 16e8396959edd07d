use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use ferrite_types::Fact;

use crate::MemoryError;

/// SQLite-backed fact storage. Scope is `global`, `project`, or `session`;
/// session facts carry the conversation id as `session_id`.
pub struct FactsStore {
    conn: Arc<Mutex<Connection>>,
}

impl FactsStore {
    pub async fn open(db_path: &Path) -> Result<Self, MemoryError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.busy_timeout(Duration::from_secs(10))?;
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        conn.execute(
            "CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                status TEXT NOT NULL,
                scope TEXT NOT NULL,
                session_id TEXT,
                project_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_facts_scope_status
             ON facts(scope, status, session_id)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_fact(
        &self,
        key: &str,
        value: &Value,
        scope: &str,
        session_id: Option<&str>,
    ) -> Result<Fact, MemoryError> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO facts (id, key, value_json, status, scope, session_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
            params![id, key, serde_json::to_string(value)?, scope, session_id, now],
        )?;
        Ok(Fact {
            id,
            key: key.to_string(),
            value: value.clone(),
            status: "active".to_string(),
            scope: scope.to_string(),
            session_id: session_id.map(ToString::to_string),
            project_id: None,
            created_at: Some(now.clone()),
            updated_at: Some(now),
        })
    }

    pub async fn set_status(&self, id: &str, status: &str) -> Result<bool, MemoryError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE facts SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub async fn list_facts(
        &self,
        scope: &str,
        status: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<Fact>, MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, key, value_json, status, scope, session_id, project_id, created_at, updated_at
             FROM facts
             WHERE scope = ?1 AND status = ?2 AND (?3 IS NULL OR session_id = ?3)
             ORDER BY key, id",
        )?;
        let rows = stmt.query_map(params![scope, status, session_id], |row| {
            let value_raw: String = row.get(2)?;
            Ok(Fact {
                id: row.get(0)?,
                key: row.get(1)?,
                value: serde_json::from_str(&value_raw).unwrap_or(Value::Null),
                status: row.get(3)?,
                scope: row.get(4)?,
                session_id: row.get(5)?,
                project_id: row.get(6)?,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
