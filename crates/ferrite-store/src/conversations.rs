use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ferrite_types::{task_result, Run};

use crate::{now_ms, Store, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl Store {
    pub async fn create_conversation(&self, title: Option<&str>) -> StoreResult<Conversation> {
        let conn = self.conn().lock().await;
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        conn.execute(
            "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![id, title, now],
        )?;
        Ok(Conversation {
            id,
            title: title.map(ToString::to_string),
            created_at: ms_to_dt(now),
        })
    }

    pub async fn conversation_exists(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        run_id: Option<&str>,
    ) -> StoreResult<Message> {
        let conn = self.conn().lock().await;
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, role, content, run_id, now],
        )?;
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            run_id: run_id.map(ToString::to_string),
            created_at: ms_to_dt(now),
        })
    }

    /// Most recent messages in chronological order, capped at `limit`.
    pub async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, run_id, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit], |row| {
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                run_id: row.get(4)?,
                created_at: ms_to_dt(row.get(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    /// Turn a terminal run into one chat message.
    ///
    /// Idempotent (keyed by run id) and skipped entirely for child runs so
    /// orchestrator sub-steps do not duplicate UI turns. Returns true when a
    /// message was written.
    pub async fn emit_run_message(&self, run: &Run) -> StoreResult<bool> {
        if !run.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "Run {} is not in a final state (current: {})",
                run.id,
                run.status.as_str()
            )));
        }
        if run.is_child_run() {
            return Ok(false);
        }
        let Some(conversation_id) = run.conversation_id.as_deref() else {
            return Ok(false);
        };
        let conn = self.conn().lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM messages WHERE run_id = ?1",
                params![run.id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }
        let content = render_run_message(run);
        let now = now_ms();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, run_id, created_at)
             VALUES (?1, ?2, 'assistant', ?3, ?4, ?5)",
            params![Uuid::new_v4().to_string(), conversation_id, content, run.id, now],
        )?;
        Ok(true)
    }
}

fn render_run_message(run: &Run) -> String {
    let label = run
        .title
        .clone()
        .unwrap_or_else(|| run.run_type.clone());
    if let Some(output) = run.output.as_ref() {
        let reply = task_result::extract_reply(output);
        if !reply.is_empty() {
            return reply;
        }
    }
    match run.error.as_deref() {
        Some(error) => format!("[{}] {}: {}", run.status.as_str(), label, error),
        None => format!("[{}] {}", run.status.as_str(), label),
    }
}
