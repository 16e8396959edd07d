use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{now_ms, Store, StoreResult};

/// Audit row for one sandbox execution, persisted alongside the on-disk
/// artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecRecord {
    pub exec_id: String,
    pub project_id: String,
    pub skill_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: String,
    pub exit_code: Option<i64>,
    pub policy_snapshot: Value,
    pub artifacts_path: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub(crate) fn init_execs_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_execs (
                exec_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                skill_id TEXT,
                conversation_id TEXT,
                status TEXT NOT NULL,
                exit_code INTEGER,
                policy_snapshot TEXT NOT NULL,
                artifacts_path TEXT NOT NULL,
                stdout_truncated INTEGER NOT NULL DEFAULT 0,
                stderr_truncated INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn record_sandbox_exec(&self, record: &SandboxExecRecord) -> StoreResult<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sandbox_execs
             (exec_id, project_id, skill_id, conversation_id, status, exit_code,
              policy_snapshot, artifacts_path, stdout_truncated, stderr_truncated,
              duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.exec_id,
                record.project_id,
                record.skill_id,
                record.conversation_id,
                record.status,
                record.exit_code,
                serde_json::to_string(&record.policy_snapshot)?,
                record.artifacts_path,
                record.stdout_truncated,
                record.stderr_truncated,
                record.duration_ms,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_sandbox_exec(&self, exec_id: &str) -> StoreResult<Option<SandboxExecRecord>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT exec_id, project_id, skill_id, conversation_id, status, exit_code,
                        policy_snapshot, artifacts_path, stdout_truncated, stderr_truncated,
                        duration_ms, created_at
                 FROM sandbox_execs WHERE exec_id = ?1",
                params![exec_id],
                |row| {
                    let policy_raw: String = row.get(6)?;
                    Ok(SandboxExecRecord {
                        exec_id: row.get(0)?,
                        project_id: row.get(1)?,
                        skill_id: row.get(2)?,
                        conversation_id: row.get(3)?,
                        status: row.get(4)?,
                        exit_code: row.get(5)?,
                        policy_snapshot: serde_json::from_str(&policy_raw)
                            .unwrap_or(Value::Null),
                        artifacts_path: row.get(7)?,
                        stdout_truncated: row.get(8)?,
                        stderr_truncated: row.get(9)?,
                        duration_ms: row.get(10)?,
                        created_at: chrono::TimeZone::timestamp_millis_opt(
                            &Utc,
                            row.get(11)?,
                        )
                        .single()
                        .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
