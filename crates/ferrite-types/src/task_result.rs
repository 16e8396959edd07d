use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

pub const TASK_RESULT_VERSION: &str = "task_result_v0";

/// One scoped region within a handler: outcome, timing, metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub error_code: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// The fixed envelope every task handler produces, stored as `run.output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub version: String,
    pub ok: bool,
    pub trace_id: String,
    pub task_type: String,
    pub result: Map<String, Value>,
    pub artifacts: Map<String, Value>,
    pub steps: Vec<StepRecord>,
    pub trace_lines: Vec<String>,
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts_snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts_snapshot_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yielded: Option<bool>,
}

impl TaskResult {
    /// Observation for the next orchestrator decision. Stable fallback chain:
    /// top-level `result.observation`, else empty.
    pub fn observation(&self) -> Map<String, Value> {
        match self.result.get("observation").and_then(|v| v.as_object()) {
            Some(obj) => obj.clone(),
            None => Map::new(),
        }
    }

    /// Final user-facing reply. Priority: `result.reply`, then
    /// `result.final_response`.
    pub fn reply(&self) -> String {
        for key in ["reply", "final_response"] {
            if let Some(s) = self.result.get(key).and_then(|v| v.as_str()) {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        String::new()
    }
}

/// Same extraction chain applied to an untyped output value (as read back
/// from storage), preferring top-level keys then `result.*`.
pub fn extract_observation(output: &Value) -> Map<String, Value> {
    if let Some(obs) = output.get("observation").and_then(|v| v.as_object()) {
        return obs.clone();
    }
    output
        .get("result")
        .and_then(|r| r.get("observation"))
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

pub fn extract_reply(output: &Value) -> String {
    for key in ["reply", "final_response"] {
        if let Some(s) = output.get(key).and_then(|v| v.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    let result = output.get("result").cloned().unwrap_or(Value::Null);
    for key in ["reply", "final_response"] {
        if let Some(s) = result.get(key).and_then(|v| v.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}
