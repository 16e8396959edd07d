use std::time::Duration;

use serde_json::{json, Value};

use ferrite_orchestrator::{
    orchestration_step, AgentDecider, DecisionRequest, LlmDecider, StepOutcome,
};
use ferrite_providers::ChatMessage;
use ferrite_types::{task_result, Run, TaskError};

use crate::handlers::{ExecuteError, HandlerError, HeartbeatFn, TaskRunner};
use crate::task_context::TaskContext;

const HISTORY_LIMIT: i64 = 20;
const RECENT_RUNS_LIMIT: i64 = 5;

impl TaskRunner {
    /// One user turn driven entirely in-process: the worker feeds the
    /// orchestrator's pure step function and executes each child run
    /// itself, so a single-worker deployment never waits on its own queue
    /// slot and no HTTP self-call happens. Children carry this run's id as
    /// `parent_run_id`, keeping the chat emitter quiet about sub-steps.
    pub(crate) async fn handle_agent_loop_turn(
        &self,
        run: &Run,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
    ) -> Result<(), HandlerError> {
        let Some(conversation_id) = ctx.conversation_id.clone() else {
            return Err(HandlerError::Invalid(
                "input 'conversation_id' is required".to_string(),
            ));
        };
        let Some(user_message) = ctx
            .input
            .get("user_message")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
        else {
            return Err(HandlerError::Invalid(
                "input 'user_message' is required".to_string(),
            ));
        };
        let settings = self.run_settings(run);
        let enabled = settings
            .pointer("/agent_loop/enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !enabled {
            return Err(HandlerError::Invalid(
                "agent loop is disabled by settings".to_string(),
            ));
        }
        let system_cap = settings
            .pointer("/agent_loop/max_steps")
            .and_then(|v| v.as_u64())
            .unwrap_or(3)
            .max(1) as usize;
        let decision_timeout = settings
            .pointer("/agent_loop/decision_timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);
        let allowed_run_types: Vec<String> = settings
            .pointer("/agent_loop/allowed_run_types")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["run_code_snippet".to_string()]);

        let mut step = ctx.step("gather_context");
        let history: Vec<ChatMessage> = self
            .store
            .list_recent_messages(&conversation_id, HISTORY_LIMIT)
            .await
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| ChatMessage::new(&m.role, m.content.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let recent_runs: Vec<Value> = self
            .store
            .list_runs_by_conversation(&conversation_id, Some(RECENT_RUNS_LIMIT), None)
            .await
            .map(|runs| {
                runs.iter()
                    .map(|r| {
                        json!({"id": r.id, "type": r.run_type, "status": r.status, "title": r.title})
                    })
                    .collect()
            })
            .unwrap_or_default();
        step.meta
            .insert("history_messages".to_string(), json!(history.len()));
        step.meta
            .insert("recent_runs".to_string(), json!(recent_runs.len()));
        ctx.complete_step(step);
        heartbeat.beat().await?;

        let decider = LlmDecider::new(
            self.llm.clone(),
            allowed_run_types,
            Duration::from_secs(decision_timeout),
        );

        // Strictly linear: decide, maybe run a child, observe, decide again.
        let mut previous_output: Option<Value> = None;
        let mut run_ids: Vec<String> = Vec::new();
        let mut max_steps = system_cap;
        let mut final_reply: Option<String> = None;
        for step_index in 0..=max_steps {
            let observation = previous_output.as_ref().map(task_result::extract_observation);
            let decision = match decider
                .decide(DecisionRequest {
                    user_message: &user_message,
                    conversation_id: &conversation_id,
                    history_messages: &history,
                    recent_runs: &recent_runs,
                    previous_observation: observation.as_ref(),
                })
                .await
            {
                Ok(decision) => decision,
                Err(err) => {
                    let step = ctx.step("agent_decide");
                    let task_err =
                        TaskError::new("Timeout", err.to_string(), "agent_decide");
                    ctx.fail_step(step, &task_err);
                    return Err(HandlerError::Task);
                }
            };
            if step_index == 0 {
                let llm_steps = decision
                    .run_part()
                    .and_then(|r| r.max_steps)
                    .unwrap_or(3)
                    .max(1) as usize;
                max_steps = llm_steps.min(system_cap);
            }

            match orchestration_step(
                &decision,
                step_index,
                max_steps,
                previous_output.as_ref(),
                &conversation_id,
                Some(&ctx.run_id),
            ) {
                StepOutcome::Reply(reply) => {
                    final_reply = Some(reply);
                    break;
                }
                StepOutcome::CreateRun(request) => {
                    let envelope = self
                        .execute_child(request, ctx, heartbeat, &mut run_ids)
                        .await?;
                    previous_output = Some(envelope);
                }
            }
        }

        let steps_taken = run_ids.len();
        let reply = final_reply
            .or_else(|| previous_output.as_ref().map(task_result::extract_reply))
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "任务已完成".to_string());
        ctx.result.insert("reply".to_string(), json!(reply));
        ctx.result.insert("run_ids".to_string(), json!(run_ids));
        ctx.result
            .insert("steps_taken".to_string(), json!(steps_taken));
        Ok(())
    }

    /// Create, claim, and execute one child run in-process, persisting its
    /// terminal state exactly as the queue path would.
    async fn execute_child(
        &self,
        request: ferrite_types::RunCreate,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
        run_ids: &mut Vec<String>,
    ) -> Result<Value, HandlerError> {
        let mut step = ctx.step("child_run");
        let inproc_worker = format!("inproc-{}", ctx.run_id);
        let created = match self.store.create_run(request).await {
            Ok(run) => run,
            Err(err) => {
                let task_err = TaskError::new("StoreError", err.to_string(), "child_run");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        run_ids.push(created.id.clone());
        step.meta
            .insert("run_id".to_string(), json!(created.id));
        step.meta
            .insert("run_type".to_string(), json!(created.run_type));

        let Ok(Some(claimed)) = self.store.claim_run(&created.id, &inproc_worker, 60).await
        else {
            let task_err = TaskError::new(
                "StoreError",
                format!("could not claim child run {}", created.id),
                "child_run",
            );
            ctx.fail_step(step, &task_err);
            return Err(HandlerError::Task);
        };

        // Boxed: the child may be any handler, and this call recurses
        // through the dispatcher.
        let outcome = Box::pin(self.execute(&claimed, heartbeat)).await;
        let envelope = match outcome {
            Ok(envelope) => envelope,
            Err(ExecuteError::Canceled) => {
                let _ = self
                    .store
                    .complete_canceled(&created.id, "Canceled by user")
                    .await;
                let task_err =
                    TaskError::new("Canceled", "Task was canceled", "child_run");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Canceled);
            }
            Err(ExecuteError::LeaseLost) => {
                let task_err = TaskError::new(
                    "RuntimeError",
                    "Heartbeat failed, task was taken over by another worker",
                    "child_run",
                );
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::LeaseLost);
            }
            Err(ExecuteError::Invalid(message)) => {
                let _ = self.store.complete_failed(&created.id, &message, None).await;
                let task_err = TaskError::new("InvalidInput", message, "child_run");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        let child_ok = envelope.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        if child_ok {
            let _ = self.store.complete_success(&created.id, &envelope).await;
            step.meta.insert("ok".to_string(), json!(true));
            ctx.complete_step(step);
        } else {
            let message = envelope
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("Task reported failure")
                .to_string();
            let _ = self
                .store
                .complete_failed(&created.id, &message, Some(&envelope))
                .await;
            step.meta.insert("ok".to_string(), json!(false));
            // a failed child still yields an observation for the next
            // decision, so the turn itself keeps going
            ctx.complete_step(step);
        }
        Ok(envelope)
    }
}
