mod decision;
mod step;

pub use decision::{
    AgentDecider, Decision, DecisionRequest, LlmDecider, ReplyPart, RunPart,
};
pub use step::{orchestration_step, StepOutcome, MAX_STEPS_FALLBACK_MESSAGE};

use std::time::Duration;

use serde_json::Value;

use ferrite_store::Store;
use ferrite_types::{is_valid_trace_id, new_trace_id, task_result, Run, RunCreate};

/// Wait cap so a blocked child cannot hold the caller forever.
pub const DEFAULT_MAX_WAIT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

const TIMEOUT_MESSAGE_SUFFIX: &str = " 任务可能仍在后台执行，请在任务列表中查看。";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("{0}")]
    WaitTimeout(String),
    #[error("store error: {0}")]
    Store(#[from] ferrite_store::StoreError),
    #[error("decision error: {0}")]
    Decision(String),
}

/// Poll until the run reaches a terminal status.
pub async fn wait_run_done(
    store: &Store,
    run_id: &str,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<Run, OrchestratorError> {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        tokio::time::sleep(poll_interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(OrchestratorError::WaitTimeout(format!(
                "Run {run_id} 在 {:.0}s 内未结束。{TIMEOUT_MESSAGE_SUFFIX}",
                max_wait.as_secs_f64()
            )));
        }
    }
}

fn prepare_child_input(
    run: &RunPart,
    conversation_id: &str,
    parent_run_id: Option<&str>,
) -> Value {
    let mut input = Value::Object(run.input.clone());
    let map = input.as_object_mut().expect("object input");
    if map
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .map(|s| s.is_empty())
        .unwrap_or(true)
    {
        map.insert("conversation_id".to_string(), Value::String(conversation_id.to_string()));
    }
    let trace_ok = is_valid_trace_id(map.get("trace_id").and_then(|v| v.as_str()));
    if !trace_ok {
        map.insert("trace_id".to_string(), Value::String(new_trace_id()));
    }
    if let Some(parent) = parent_run_id {
        map.insert("parent_run_id".to_string(), Value::String(parent.to_string()));
    }
    input
}

/// Orchestrate `run_code_snippet` children for one user turn, strictly
/// linear: create child → wait for terminal → observe → decide again, capped
/// by `min(max(1, llm max_steps), system_cap)`.
///
/// Returns `(final_reply, child_run_ids)`. The reply is `None` when the first
/// decision is neither a reply nor a `run_code_snippet` run, so the caller
/// can fall back to its own response path.
#[allow(clippy::too_many_arguments)]
pub async fn run_code_snippet_loop(
    store: &Store,
    decider: &dyn AgentDecider,
    conversation_id: &str,
    user_message: &str,
    history_messages: &[ferrite_providers::ChatMessage],
    recent_runs: &[Value],
    initial_decision: Option<Decision>,
    parent_run_id: Option<&str>,
    system_cap: usize,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<(Option<String>, Vec<String>), OrchestratorError> {
    let initial_is_snippet = initial_decision
        .as_ref()
        .and_then(|d| d.run_part())
        .map(|r| r.is_code_snippet())
        .unwrap_or(false);
    let mut decision = if initial_is_snippet {
        initial_decision.expect("checked above")
    } else {
        let first = decider
            .decide(DecisionRequest {
                user_message,
                conversation_id,
                history_messages,
                recent_runs,
                previous_observation: None,
            })
            .await
            .map_err(|err| OrchestratorError::Decision(err.to_string()))?;
        let first_is_snippet = first
            .run_part()
            .map(|r| r.is_code_snippet())
            .unwrap_or(false);
        if !first_is_snippet {
            let content = first.reply_content().unwrap_or_default();
            if content.is_empty() && first.run_part().is_some() {
                return Ok((None, Vec::new()));
            }
            return Ok((Some(content), Vec::new()));
        }
        first
    };

    let llm_steps = decision
        .run_part()
        .and_then(|r| r.max_steps)
        .unwrap_or(3)
        .max(1) as usize;
    let max_steps = llm_steps.min(system_cap.max(1));

    let mut run_ids = Vec::new();
    let mut reply = String::new();
    for step in 0..max_steps {
        let run_part = decision.run_part().expect("loop decisions carry a run");
        let input = prepare_child_input(run_part, conversation_id, parent_run_id);
        let created = store
            .create_run(RunCreate {
                run_type: run_part.run_type.clone(),
                title: run_part.title.clone(),
                conversation_id: Some(conversation_id.to_string()),
                input,
                parent_run_id: parent_run_id.map(ToString::to_string),
            })
            .await?;
        run_ids.push(created.id.clone());
        tracing::info!(
            step = step + 1,
            max_steps,
            run_id = %created.id,
            "orchestrator step"
        );

        let done = wait_run_done(store, &created.id, poll_interval, max_wait).await?;
        let output = done.output.clone().unwrap_or(Value::Null);
        let observation = task_result::extract_observation(&output);
        reply = task_result::extract_reply(&output);

        if step + 1 >= max_steps {
            let final_reply = if reply.trim().is_empty() {
                MAX_STEPS_FALLBACK_MESSAGE.to_string()
            } else {
                reply.trim().to_string()
            };
            return Ok((Some(final_reply), run_ids));
        }

        let next = decider
            .decide(DecisionRequest {
                user_message,
                conversation_id,
                history_messages,
                recent_runs,
                previous_observation: Some(&observation),
            })
            .await
            .map_err(|err| OrchestratorError::Decision(err.to_string()))?;
        let next_is_snippet = next
            .run_part()
            .map(|r| r.is_code_snippet())
            .unwrap_or(false);
        if !next_is_snippet {
            let content = next.reply_content().unwrap_or_default();
            let final_reply = if content.is_empty() { reply } else { content };
            return Ok((Some(final_reply), run_ids));
        }
        decision = next;
    }

    let final_reply = if reply.trim().is_empty() {
        MAX_STEPS_FALLBACK_MESSAGE.to_string()
    } else {
        reply.trim().to_string()
    };
    Ok((Some(final_reply), run_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDecider {
        decisions: Vec<Decision>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentDecider for ScriptedDecider {
        async fn decide(&self, _req: DecisionRequest<'_>) -> anyhow::Result<Decision> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .decisions
                .get(idx)
                .cloned()
                .unwrap_or(Decision::Reply {
                    reply: ReplyPart {
                        content: "done".to_string(),
                    },
                }))
        }
    }

    fn code_run_decision(max_steps: Option<i64>) -> Decision {
        Decision::Run {
            run: RunPart {
                run_type: "run_code_snippet".to_string(),
                title: Some("step".to_string()),
                input: json!({"language": "python", "code": "print(1)"})
                    .as_object()
                    .unwrap()
                    .clone(),
                max_steps,
            },
        }
    }

    async fn complete_children(store: Store, reply: &'static str) {
        // Worker stand-in: drive queued children to success.
        loop {
            if let Ok(Some(run)) = store.claim_next("test-worker", 60).await {
                let _ = store
                    .complete_success(
                        &run.id,
                        &json!({"ok": true, "result": {"reply": reply, "observation": {"exit_code": 0}}}),
                    )
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn reply_decision_short_circuits() {
        let store = Store::open_in_memory().await.unwrap();
        let decider = ScriptedDecider {
            decisions: vec![Decision::Reply {
                reply: ReplyPart {
                    content: "hello".to_string(),
                },
            }],
            calls: AtomicUsize::new(0),
        };
        let conv = store.create_conversation(None).await.unwrap();
        let (reply, run_ids) = run_code_snippet_loop(
            &store,
            &decider,
            &conv.id,
            "hi",
            &[],
            &[],
            None,
            None,
            3,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(reply.as_deref(), Some("hello"));
        assert!(run_ids.is_empty());
    }

    #[tokio::test]
    async fn loop_creates_children_until_reply() {
        let store = Store::open_in_memory().await.unwrap();
        let conv = store.create_conversation(None).await.unwrap();
        tokio::spawn(complete_children(store.clone(), "child reply"));
        let decider = ScriptedDecider {
            decisions: vec![
                code_run_decision(Some(5)),
                code_run_decision(None),
                Decision::Reply {
                    reply: ReplyPart {
                        content: "final answer".to_string(),
                    },
                },
            ],
            calls: AtomicUsize::new(0),
        };
        let (reply, run_ids) = run_code_snippet_loop(
            &store,
            &decider,
            &conv.id,
            "compute",
            &[],
            &[],
            None,
            None,
            3,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(reply.as_deref(), Some("final answer"));
        assert_eq!(run_ids.len(), 2);
        // every child carries conversation and a fresh trace id
        for id in &run_ids {
            let run = store.get_run(id).await.unwrap().unwrap();
            assert_eq!(run.conversation_id.as_deref(), Some(conv.id.as_str()));
            let trace = run.input.get("trace_id").and_then(|v| v.as_str()).unwrap();
            assert_eq!(trace.len(), 32);
        }
    }

    #[tokio::test]
    async fn max_steps_clamp_yields_fallback_reply() {
        let store = Store::open_in_memory().await.unwrap();
        let conv = store.create_conversation(None).await.unwrap();
        tokio::spawn(complete_children(store.clone(), ""));
        // Decider always wants another run; system cap 2 stops it.
        let decider = ScriptedDecider {
            decisions: vec![
                code_run_decision(Some(99)),
                code_run_decision(None),
                code_run_decision(None),
                code_run_decision(None),
            ],
            calls: AtomicUsize::new(0),
        };
        let (reply, run_ids) = run_code_snippet_loop(
            &store,
            &decider,
            &conv.id,
            "loop forever",
            &[],
            &[],
            None,
            None,
            2,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(run_ids.len(), 2);
        assert_eq!(reply.as_deref(), Some(MAX_STEPS_FALLBACK_MESSAGE));
    }

    #[tokio::test]
    async fn parent_run_id_propagates_to_children() {
        let store = Store::open_in_memory().await.unwrap();
        let conv = store.create_conversation(None).await.unwrap();
        let parent = store
            .create_run(RunCreate {
                run_type: "agent_loop_turn".to_string(),
                title: None,
                conversation_id: Some(conv.id.clone()),
                input: json!({}),
                parent_run_id: None,
            })
            .await
            .unwrap();
        tokio::spawn(complete_children(store.clone(), "ok"));
        let decider = ScriptedDecider {
            decisions: vec![code_run_decision(Some(1))],
            calls: AtomicUsize::new(0),
        };
        let (_, run_ids) = run_code_snippet_loop(
            &store,
            &decider,
            &conv.id,
            "go",
            &[],
            &[],
            None,
            Some(&parent.id),
            3,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let child = store.get_run(&run_ids[0]).await.unwrap().unwrap();
        assert_eq!(child.parent_run_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(
            child.input.get("parent_run_id").and_then(|v| v.as_str()),
            Some(parent.id.as_str())
        );
        assert!(child.is_child_run());
    }

    #[tokio::test]
    async fn wait_timeout_mentions_background_execution() {
        let store = Store::open_in_memory().await.unwrap();
        let run = store
            .create_run(RunCreate {
                run_type: "sleep".to_string(),
                title: None,
                conversation_id: None,
                input: json!({"seconds": 600}),
                parent_run_id: None,
            })
            .await
            .unwrap();
        let err = wait_run_done(
            &store,
            &run.id,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("任务可能仍在后台执行"));
    }
}
