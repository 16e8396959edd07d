use std::fmt::Display;
use std::path::PathBuf;
use std::time::Instant;

use serde_json::{Map, Value};

use ferrite_observability::TraceCollector;
use ferrite_types::{
    is_valid_trace_id, new_trace_id, ErrorCode, Run, StepRecord, TaskError, TaskResult,
    TASK_RESULT_VERSION,
};

/// Outputs past this size get a `task.output.too_large` trace line
/// (non-fatal).
const OUTPUT_SIZE_WARN_THRESHOLD: usize = 1024 * 1024;

const ERROR_MESSAGE_MAX: usize = 500;

/// User-visible hint for rate-limit style blocks, so "blocked upstream" is
/// distinguishable from an ordinary failure.
pub const WEB_BLOCKED_USER_MESSAGE: &str = "请求过于频繁或被限制（如 403/429），请稍后再试。";

/// An open step region. Handlers stash metadata into `meta` and hand the
/// step back to the context on completion or failure.
pub struct Step {
    name: String,
    started: Instant,
    pub meta: Map<String, Value>,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-run context: trace id, trace lines, ordered steps, result and
/// artifact payloads. Handlers only write business logic; the envelope
/// shape is guaranteed here.
pub struct TaskContext {
    pub run_id: String,
    pub conversation_id: Option<String>,
    pub input: Value,
    pub title: Option<String>,
    task_type: String,
    trace_id: String,
    trace: TraceCollector,
    steps: Vec<StepRecord>,
    ok: bool,
    error: Option<TaskError>,
    pub result: Map<String, Value>,
    pub artifacts: Map<String, Value>,
    facts_snapshot: Option<(String, String)>,
    /// Set by handlers that want fetch backends to persist page artifacts.
    pub artifact_dir: Option<PathBuf>,
}

impl TaskContext {
    pub fn new(run: &Run, task_type: &str) -> Self {
        let trace_id = match run.input_trace_id() {
            Some(raw) if is_valid_trace_id(Some(raw)) => raw.to_string(),
            _ => new_trace_id(),
        };
        Self {
            run_id: run.id.clone(),
            conversation_id: run.conversation_id.clone().or_else(|| {
                run.input
                    .get("conversation_id")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
            }),
            input: run.input.clone(),
            title: run.title.clone(),
            task_type: task_type.to_string(),
            trace: TraceCollector::from_env_with_trace_id(trace_id.clone()),
            trace_id,
            steps: Vec::new(),
            ok: true,
            error: None,
            result: Map::new(),
            artifacts: Map::new(),
            facts_snapshot: None,
            artifact_dir: None,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn record_trace(&mut self, event: &str, detail: Option<&str>) {
        self.trace.record_detail(event, detail);
    }

    /// Open a step. The trace gets `<task_type>.<name>` immediately so a
    /// crash mid-step still leaves a marker.
    pub fn step(&mut self, name: &str) -> Step {
        self.trace.record(&format!("{}.{}", self.task_type, name));
        Step {
            name: name.to_string(),
            started: Instant::now(),
            meta: Map::new(),
        }
    }

    pub fn complete_step(&mut self, step: Step) {
        let duration_ms = step.started.elapsed().as_millis() as u64;
        self.steps.push(StepRecord {
            name: step.name,
            ok: true,
            duration_ms,
            error_code: None,
            meta: step.meta,
        });
    }

    /// Record a failed step. The first failure fixes the envelope's
    /// top-level error; later failures still record but do not overwrite it.
    pub fn fail_step<E: ErrorCode + Display>(&mut self, mut step: Step, err: &E) {
        let code = err.code().to_string();
        if let Some(detail) = err.detail_code() {
            step.meta
                .insert("detail_code".to_string(), Value::String(detail.to_string()));
        }
        let duration_ms = step.started.elapsed().as_millis() as u64;
        if self.ok {
            self.ok = false;
            let raw_message: String = err.to_string().chars().take(ERROR_MESSAGE_MAX).collect();
            let (message, retryable) = if code == "WebBlocked" {
                (WEB_BLOCKED_USER_MESSAGE.to_string(), true)
            } else {
                (raw_message, false)
            };
            self.error = Some(TaskError {
                code: code.clone(),
                message,
                retryable,
                step: step.name.clone(),
            });
        }
        self.steps.push(StepRecord {
            name: step.name,
            ok: false,
            duration_ms,
            error_code: Some(code),
            meta: step.meta,
        });
    }

    /// Partial-success escape hatch: a handler that produced its primary
    /// artifact despite step failures may flip the envelope back to ok.
    pub fn set_ok(&mut self, ok: bool) {
        self.ok = ok;
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn set_facts_snapshot(&mut self, snapshot_id: &str, source: &str) {
        self.facts_snapshot = Some((snapshot_id.to_string(), source.to_string()));
    }

    pub fn build_output(&mut self) -> TaskResult {
        let mut out = TaskResult {
            version: TASK_RESULT_VERSION.to_string(),
            ok: self.ok,
            trace_id: self.trace_id.clone(),
            task_type: self.task_type.clone(),
            result: self.result.clone(),
            artifacts: self.artifacts.clone(),
            steps: self.steps.clone(),
            trace_lines: self.trace.render_lines(),
            error: self.error.clone(),
            facts_snapshot_id: self.facts_snapshot.as_ref().map(|(id, _)| id.clone()),
            facts_snapshot_source: self.facts_snapshot.as_ref().map(|(_, s)| s.clone()),
            yielded: None,
        };
        if let Ok(payload) = serde_json::to_string(&out) {
            if payload.len() > OUTPUT_SIZE_WARN_THRESHOLD {
                self.trace
                    .record_detail("task.output.too_large", Some(&payload.len().to_string()));
                out.trace_lines = self.trace.render_lines();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ferrite_types::RunStatus;
    use serde_json::json;

    pub(crate) fn test_run(input: Value) -> Run {
        Run {
            id: "run-1".to_string(),
            run_type: "sleep".to_string(),
            title: None,
            status: RunStatus::Running,
            conversation_id: None,
            input,
            output: None,
            error: None,
            progress: None,
            attempt: 1,
            worker_id: Some("w".to_string()),
            lease_expires_at: None,
            parent_run_id: None,
            canceled_at: None,
            canceled_by: None,
            cancel_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct CodedError(&'static str, String, Option<&'static str>);

    impl Display for CodedError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.1)
        }
    }

    impl ErrorCode for CodedError {
        fn code(&self) -> &str {
            self.0
        }
        fn detail_code(&self) -> Option<&str> {
            self.2
        }
    }

    #[test]
    fn valid_input_trace_id_is_adopted() {
        let run = test_run(json!({"trace_id": "a".repeat(32)}));
        let ctx = TaskContext::new(&run, "sleep");
        assert_eq!(ctx.trace_id(), &"a".repeat(32));
    }

    #[test]
    fn invalid_trace_id_gets_replaced() {
        let run = test_run(json!({"trace_id": "nope"}));
        let ctx = TaskContext::new(&run, "sleep");
        assert_eq!(ctx.trace_id().len(), 32);
        assert_ne!(ctx.trace_id(), "nope");
    }

    #[test]
    fn first_failure_wins_the_top_level_error() {
        let run = test_run(json!({}));
        let mut ctx = TaskContext::new(&run, "research_report");
        let step = ctx.step("tool.web.fetch");
        ctx.fail_step(step, &CodedError("Timeout", "read timed out".into(), None));
        let step = ctx.step("tool.web.fetch");
        ctx.fail_step(step, &CodedError("NetworkError", "dns failed".into(), None));
        let out = ctx.build_output();
        assert!(!out.ok);
        let error = out.error.unwrap();
        assert_eq!(error.code, "Timeout");
        assert_eq!(error.step, "tool.web.fetch");
        assert_eq!(out.steps.len(), 2);
        assert_eq!(out.steps[1].error_code.as_deref(), Some("NetworkError"));
    }

    #[test]
    fn web_blocked_gets_localized_retryable_message() {
        let run = test_run(json!({}));
        let mut ctx = TaskContext::new(&run, "research_report");
        let step = ctx.step("tool.web.search");
        ctx.fail_step(
            step,
            &CodedError("WebBlocked", "HTTP 403".into(), Some("http_403")),
        );
        let out = ctx.build_output();
        let error = out.error.unwrap();
        assert_eq!(error.code, "WebBlocked");
        assert_eq!(error.message, WEB_BLOCKED_USER_MESSAGE);
        assert!(error.retryable);
        assert_eq!(
            out.steps[0].meta.get("detail_code"),
            Some(&json!("http_403"))
        );
    }

    #[test]
    fn long_messages_are_truncated() {
        let run = test_run(json!({}));
        let mut ctx = TaskContext::new(&run, "sleep");
        let step = ctx.step("sleep");
        ctx.fail_step(step, &CodedError("RuntimeError", "x".repeat(2000), None));
        let out = ctx.build_output();
        assert_eq!(out.error.unwrap().message.chars().count(), 500);
    }

    #[test]
    fn partial_success_clears_error_but_keeps_step_records() {
        let run = test_run(json!({}));
        let mut ctx = TaskContext::new(&run, "research_report");
        let step = ctx.step("tool.web.fetch");
        ctx.fail_step(step, &CodedError("Timeout", "slow".into(), None));
        ctx.set_ok(true);
        ctx.clear_error();
        let out = ctx.build_output();
        assert!(out.ok);
        assert!(out.error.is_none());
        assert!(!out.steps[0].ok);
    }

    #[test]
    fn trace_lines_carry_the_trace_id() {
        let trace_id = "b".repeat(32);
        let run = test_run(json!({"trace_id": trace_id}));
        let mut ctx = TaskContext::new(&run, "sleep");
        let step = ctx.step("sleep");
        ctx.complete_step(step);
        let out = ctx.build_output();
        assert!(out
            .trace_lines
            .iter()
            .any(|line| line.contains(&trace_id)));
    }

    #[test]
    fn facts_snapshot_fields_surface_in_envelope() {
        let run = test_run(json!({}));
        let mut ctx = TaskContext::new(&run, "summarize_conversation");
        ctx.set_facts_snapshot(&"c".repeat(64), "store");
        let out = ctx.build_output();
        assert_eq!(out.facts_snapshot_id.as_deref(), Some("c".repeat(64).as_str()));
        assert_eq!(out.facts_snapshot_source.as_deref(), Some("store"));
    }
}
