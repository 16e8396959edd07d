use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Durable typed record for one unit of background work.
///
/// Invariants enforced by the store:
/// - `status == Running` iff `worker_id` and `lease_expires_at` are both set.
/// - terminal statuses are final; `output`/`error` are immutable afterwards.
/// - `attempt` never decreases and is bumped exactly once per successful claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(rename = "type")]
    pub run_type: String,
    pub title: Option<String>,
    pub status: RunStatus,
    pub conversation_id: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub progress: Option<i64>,
    pub attempt: i64,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub parent_run_id: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// `input.trace_id` when present and well-formed.
    pub fn input_trace_id(&self) -> Option<&str> {
        self.input.get("trace_id").and_then(|v| v.as_str())
    }

    /// Child runs carry `parent_run_id` either as a column or inside input;
    /// the chat emitter skips both forms.
    pub fn is_child_run(&self) -> bool {
        self.parent_run_id.is_some()
            || self
                .input
                .get("parent_run_id")
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false)
    }
}

/// Creation request for a run; status starts at `queued`, attempt 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreate {
    #[serde(rename = "type")]
    pub run_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub input: Value,
    #[serde(default)]
    pub parent_run_id: Option<String>,
}
