use serde_json::Value;

use ferrite_types::{is_valid_trace_id, new_trace_id, task_result, RunCreate};

use crate::decision::Decision;

pub const MAX_STEPS_FALLBACK_MESSAGE: &str =
    "已达最大步数，未得到最终回复。请在任务详情中查看各步输出。";

const DEFAULT_DONE_REPLY: &str = "任务已完成";

/// Result of one orchestration step: either the final reply text, or the
/// next child run to create.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Reply(String),
    CreateRun(RunCreate),
}

/// Compute a single orchestration step with no I/O: no run creation, no
/// waiting, no LLM call. The worker drives this in-process to execute child
/// runs without calling back into its own HTTP surface.
pub fn orchestration_step(
    decision: &Decision,
    step_index: usize,
    max_steps: usize,
    previous_output: Option<&Value>,
    conversation_id: &str,
    parent_run_id: Option<&str>,
) -> StepOutcome {
    if step_index >= max_steps {
        return StepOutcome::Reply(MAX_STEPS_FALLBACK_MESSAGE.to_string());
    }

    let reply_from_prev = previous_output
        .map(task_result::extract_reply)
        .unwrap_or_default();

    // reply_and_run carries both parts; the run drives the step and the
    // reply text only matters once the loop finishes
    if let Decision::Reply { reply } = decision {
        let content = reply.content.trim().to_string();
        let final_reply = if !content.is_empty() {
            content
        } else if !reply_from_prev.is_empty() {
            reply_from_prev
        } else {
            DEFAULT_DONE_REPLY.to_string()
        };
        return StepOutcome::Reply(final_reply);
    }

    let Some(run) = decision.run_part() else {
        return StepOutcome::Reply(if reply_from_prev.is_empty() {
            DEFAULT_DONE_REPLY.to_string()
        } else {
            reply_from_prev
        });
    };
    if !run.is_code_snippet() {
        return StepOutcome::Reply(if reply_from_prev.is_empty() {
            DEFAULT_DONE_REPLY.to_string()
        } else {
            reply_from_prev
        });
    }

    let mut input = run.input.clone();
    if input
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .map(|s| s.is_empty())
        .unwrap_or(true)
    {
        input.insert(
            "conversation_id".to_string(),
            Value::String(conversation_id.to_string()),
        );
    }
    if !is_valid_trace_id(input.get("trace_id").and_then(|v| v.as_str())) {
        input.insert("trace_id".to_string(), Value::String(new_trace_id()));
    }
    if let Some(parent) = parent_run_id {
        input.insert(
            "parent_run_id".to_string(),
            Value::String(parent.to_string()),
        );
    }

    StepOutcome::CreateRun(RunCreate {
        run_type: run.run_type.clone(),
        title: run.title.clone(),
        conversation_id: Some(conversation_id.to_string()),
        input: Value::Object(input),
        parent_run_id: parent_run_id.map(ToString::to_string),
    })
}
