use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use ferrite_types::{Run, RunCreate, RunStatus};

use crate::{now_ms, Store, StoreError, StoreResult};

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get("status")?;
    let input_raw: String = row.get("input_json")?;
    let output_raw: Option<String> = row.get("output_json")?;
    Ok(Run {
        id: row.get("id")?,
        run_type: row.get("type")?,
        title: row.get("title")?,
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Failed),
        conversation_id: row.get("conversation_id")?,
        input: serde_json::from_str(&input_raw).unwrap_or(Value::Null),
        output: output_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        error: row.get("error")?,
        progress: row.get("progress")?,
        attempt: row.get("attempt")?,
        worker_id: row.get("worker_id")?,
        lease_expires_at: row
            .get::<_, Option<i64>>("lease_expires_at")?
            .map(ms_to_dt),
        parent_run_id: row.get("parent_run_id")?,
        canceled_at: row.get::<_, Option<i64>>("canceled_at")?.map(ms_to_dt),
        canceled_by: row.get("canceled_by")?,
        cancel_reason: row.get("cancel_reason")?,
        created_at: ms_to_dt(row.get("created_at")?),
        updated_at: ms_to_dt(row.get("updated_at")?),
    })
}

fn get_run_sync(conn: &Connection, id: &str) -> StoreResult<Option<Run>> {
    let run = conn
        .query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
        .optional()?;
    Ok(run)
}

impl Store {
    pub async fn create_run(&self, req: RunCreate) -> StoreResult<Run> {
        let conn = self.conn().lock().await;
        if let Some(conversation_id) = req.conversation_id.as_deref() {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound("conversation"));
            }
        }
        if let Some(parent_run_id) = req.parent_run_id.as_deref() {
            if get_run_sync(&conn, parent_run_id)?.is_none() {
                return Err(StoreError::NotFound("parent run"));
            }
        }
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let input_json = serde_json::to_string(&req.input)?;
        conn.execute(
            "INSERT INTO runs (id, type, title, status, conversation_id, input_json,
                               attempt, parent_run_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, 0, ?6, ?7, ?7)",
            params![
                id,
                req.run_type,
                req.title,
                req.conversation_id,
                input_json,
                req.parent_run_id,
                now
            ],
        )?;
        get_run_sync(&conn, &id)?.ok_or(StoreError::NotFound("run"))
    }

    pub async fn get_run(&self, id: &str) -> StoreResult<Option<Run>> {
        let conn = self.conn().lock().await;
        get_run_sync(&conn, id)
    }

    /// Runs ordered by `updated_at DESC`, optionally filtered by status.
    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> StoreResult<Vec<Run>> {
        let conn = self.conn().lock().await;
        let limit = limit.unwrap_or(-1);
        let offset = offset.unwrap_or(0);
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE status = ?1
                     ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![status.as_str(), limit, offset], row_to_run)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], row_to_run)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub async fn list_runs_by_conversation(
        &self,
        conversation_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> StoreResult<Vec<Run>> {
        let conn = self.conn().lock().await;
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound("conversation"));
        }
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE conversation_id = ?1
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, limit.unwrap_or(-1), offset.unwrap_or(0)],
            row_to_run,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Atomic cancel: only {queued, running} transition, lease cleared.
    /// A run already terminal yields `Conflict`; unknown id yields `NotFound`.
    pub async fn cancel_run(&self, id: &str, reason: Option<&str>) -> StoreResult<Run> {
        let conn = self.conn().lock().await;
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE runs SET status = 'canceled', canceled_at = ?2, canceled_by = 'user',
                             cancel_reason = ?3, worker_id = NULL, lease_expires_at = NULL,
                             updated_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![id, now, reason],
        )?;
        if changed == 0 {
            return match get_run_sync(&conn, id)? {
                None => Err(StoreError::NotFound("run")),
                Some(run) => Err(StoreError::Conflict(format!(
                    "Cannot cancel run with status: {}. Only queued or running runs can be canceled.",
                    run.status.as_str()
                ))),
            };
        }
        get_run_sync(&conn, id)?.ok_or(StoreError::NotFound("run"))
    }

    pub async fn delete_run(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let changed = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub async fn update_progress(&self, id: &str, progress: i64) -> StoreResult<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE runs SET progress = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, progress, now_ms()],
        )?;
        Ok(())
    }

    /// Claim the oldest eligible run for `worker_id`.
    ///
    /// Eligible: `queued`, or `running` with an expired lease. FIFO by
    /// `updated_at` ascending, ties broken by `created_at`. The conditional
    /// update is the arbiter under concurrency: a row that changed between
    /// observation and update affects zero rows and the next candidate is
    /// tried.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<Option<Run>> {
        let conn = self.conn().lock().await;
        let now = now_ms();
        let candidates: Vec<(String, String, Option<String>)> = {
            let mut stmt = conn.prepare(
                "SELECT id, status, worker_id FROM runs
                 WHERE status = 'queued'
                    OR (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1)
                 ORDER BY updated_at ASC, created_at ASC
                 LIMIT 16",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        for (id, observed_status, observed_worker) in candidates {
            let changed = conn.execute(
                "UPDATE runs SET status = 'running', worker_id = ?2,
                                 lease_expires_at = ?3, attempt = attempt + 1, updated_at = ?4
                 WHERE id = ?1 AND status = ?5 AND ifnull(worker_id, '') = ifnull(?6, '')
                   AND (status = 'queued'
                        OR (lease_expires_at IS NOT NULL AND lease_expires_at < ?4))",
                params![
                    id,
                    worker_id,
                    now + lease_seconds * 1000,
                    now,
                    observed_status,
                    observed_worker
                ],
            )?;
            if changed == 1 {
                return get_run_sync(&conn, &id);
            }
        }
        Ok(None)
    }

    /// Claim one specific queued run, for in-process child execution where
    /// the caller just created the run and wants exactly that one.
    pub async fn claim_run(
        &self,
        id: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<Option<Run>> {
        let conn = self.conn().lock().await;
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE runs SET status = 'running', worker_id = ?2,
                             lease_expires_at = ?3, attempt = attempt + 1, updated_at = ?4
             WHERE id = ?1 AND status = 'queued'",
            params![id, worker_id, now + lease_seconds * 1000, now],
        )?;
        if changed == 1 {
            get_run_sync(&conn, id)
        } else {
            Ok(None)
        }
    }

    /// Conditional lease extension. Returns false when the worker no longer
    /// owns the run (pre-empted, canceled, or completed elsewhere).
    pub async fn heartbeat(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE runs SET lease_expires_at = ?3, updated_at = ?4
             WHERE id = ?1 AND worker_id = ?2 AND status = 'running'",
            params![run_id, worker_id, now + lease_seconds * 1000, now],
        )?;
        Ok(changed == 1)
    }

    pub async fn complete_success(&self, id: &str, output: &Value) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE runs SET status = 'succeeded', output_json = ?2, error = NULL,
                             worker_id = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, serde_json::to_string(output)?, now_ms()],
        )?;
        Ok(changed == 1)
    }

    pub async fn complete_failed(
        &self,
        id: &str,
        error: &str,
        output: Option<&Value>,
    ) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let output_json = match output {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let changed = conn.execute(
            "UPDATE runs SET status = 'failed', error = ?2, output_json = coalesce(?3, output_json),
                             worker_id = NULL, lease_expires_at = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, error, output_json, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Terminal cancel from the worker side. Idempotent when the API already
    /// canceled the row; keeps whoever canceled first as `canceled_by`.
    pub async fn complete_canceled(&self, id: &str, reason: &str) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE runs SET status = 'canceled',
                             canceled_at = coalesce(canceled_at, ?2),
                             canceled_by = coalesce(canceled_by, 'worker'),
                             cancel_reason = coalesce(cancel_reason, ?3),
                             worker_id = NULL, lease_expires_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'running', 'canceled')",
            params![id, now, reason],
        )?;
        Ok(changed == 1)
    }

    /// Yielded orchestrator parent: back to `queued` without a terminal write.
    pub async fn requeue(&self, id: &str, worker_id: &str) -> StoreResult<bool> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE runs SET status = 'queued', worker_id = NULL,
                             lease_expires_at = NULL, updated_at = ?3
             WHERE id = ?1 AND worker_id = ?2 AND status = 'running'",
            params![id, worker_id, now_ms()],
        )?;
        Ok(changed == 1)
    }
}
