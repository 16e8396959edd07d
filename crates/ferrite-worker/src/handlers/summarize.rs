use serde_json::json;

use ferrite_memory::{compute_facts_snapshot_id, fetch_active_facts, format_facts_block, FactsSource};
use ferrite_types::{Fact, TaskError};

use crate::handlers::{HandlerError, HeartbeatFn, TaskRunner};
use crate::task_context::TaskContext;

const DEFAULT_MAX_MESSAGES: i64 = 20;

impl TaskRunner {
    /// Steps: fetch_messages → fetch_facts → build_prompt → llm_generate.
    /// Facts come from the input (`provided`), the store, or degrade to an
    /// empty `fallback_zero` set; the snapshot id always lands in the
    /// envelope.
    pub(crate) async fn handle_summarize(
        &self,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
    ) -> Result<(), HandlerError> {
        let Some(conversation_id) = ctx.conversation_id.clone() else {
            return Err(HandlerError::Invalid(
                "input 'conversation_id' is required".to_string(),
            ));
        };
        let max_messages = ctx
            .input
            .get("max_messages")
            .and_then(|v| v.as_i64())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGES);

        let mut step = ctx.step("fetch_messages");
        let messages = match self
            .store
            .list_recent_messages(&conversation_id, max_messages)
            .await
        {
            Ok(messages) => {
                step.meta
                    .insert("message_count".to_string(), json!(messages.len()));
                ctx.complete_step(step);
                messages
            }
            Err(err) => {
                let task_err =
                    TaskError::new("StoreError", err.to_string(), "fetch_messages");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        heartbeat.beat().await?;

        let mut step = ctx.step("fetch_facts");
        let (facts, source) = self.resolve_facts(ctx, &conversation_id).await;
        let snapshot_id = compute_facts_snapshot_id(&facts);
        step.meta.insert("fact_count".to_string(), json!(facts.len()));
        step.meta
            .insert("source".to_string(), json!(source_label(source)));
        ctx.complete_step(step);
        ctx.set_facts_snapshot(&snapshot_id, source_label(source));
        ctx.artifacts.insert(
            "facts".to_string(),
            json!({"snapshot_id": snapshot_id, "source": source_label(source)}),
        );
        heartbeat.beat().await?;

        let mut step = ctx.step("build_prompt");
        let facts_block = format_facts_block(&facts);
        let transcript: String = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{facts_block}Summarize the following conversation as concise markdown.\n\
             Keep decisions, open questions, and user preferences.\n\n{transcript}\n"
        );
        step.meta
            .insert("prompt_chars".to_string(), json!(prompt.chars().count()));
        ctx.complete_step(step);
        heartbeat.beat().await?;

        let step = ctx.step("llm_generate");
        match self.llm.generate(&prompt).await {
            Ok(summary) => {
                ctx.complete_step(step);
                ctx.artifacts.insert(
                    "summary".to_string(),
                    json!({"text": summary, "format": "markdown"}),
                );
                ctx.result
                    .insert("message_count".to_string(), json!(messages.len()));
                Ok(())
            }
            Err(err) => {
                let task_err =
                    TaskError::new("RuntimeError", err.to_string(), "llm_generate");
                ctx.fail_step(step, &task_err);
                Err(HandlerError::Task)
            }
        }
    }

    async fn resolve_facts(
        &self,
        ctx: &TaskContext,
        conversation_id: &str,
    ) -> (Vec<Fact>, FactsSource) {
        if let Some(provided) = ctx.input.get("facts").and_then(|v| v.as_array()) {
            let facts: Vec<Fact> = provided
                .iter()
                .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                .collect();
            return (facts, FactsSource::Provided);
        }
        match &self.facts {
            Some(store) => fetch_active_facts(store, Some(conversation_id), None).await,
            None => (Vec::new(), FactsSource::FallbackZero),
        }
    }
}

fn source_label(source: FactsSource) -> &'static str {
    source.as_str()
}
