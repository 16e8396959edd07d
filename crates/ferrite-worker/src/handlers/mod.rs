mod agent_turn;
mod code_snippet;
mod edit_docs;
mod research;
mod sleep;
mod summarize;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use ferrite_memory::FactsStore;
use ferrite_providers::Llm;
use ferrite_store::Store;
use ferrite_types::Run;

use crate::task_context::TaskContext;

/// How a handler ends, beyond plain success.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Failure already recorded in the envelope; the worker persists the
    /// output and fails the run from `error.message`.
    #[error("task failed")]
    Task,
    /// The run was canceled; the worker writes the canceled terminal state.
    #[error("Task was canceled")]
    Canceled,
    /// Heartbeat lost the lease; another worker owns the run now and no
    /// terminal state may be written here.
    #[error("Heartbeat failed, task was taken over by another worker")]
    LeaseLost,
    /// Input shape rejected before any step opened.
    #[error("{0}")]
    Invalid(String),
}

/// Cancel-aware lease keepalive, called between handler operations.
#[async_trait]
pub trait HeartbeatFn: Send + Sync {
    async fn beat(&self) -> Result<(), HandlerError>;
}

/// Heartbeat stub for handler tests.
pub struct NoopHeartbeat;

#[async_trait]
impl HeartbeatFn for NoopHeartbeat {
    async fn beat(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Terminal outcome classification handed back to the worker loop.
#[derive(Debug)]
pub enum ExecuteError {
    Canceled,
    LeaseLost,
    Invalid(String),
}

/// Dispatches one claimed run to its typed handler and returns the
/// `task_result_v0` envelope.
pub struct TaskRunner {
    pub(crate) store: Store,
    pub(crate) facts: Option<Arc<FactsStore>>,
    pub(crate) llm: Arc<dyn Llm>,
    pub(crate) settings: Value,
    pub(crate) docs_root: PathBuf,
}

impl TaskRunner {
    pub fn new(
        store: Store,
        facts: Option<Arc<FactsStore>>,
        llm: Arc<dyn Llm>,
        settings: Value,
        docs_root: PathBuf,
    ) -> Self {
        Self {
            store,
            facts,
            llm,
            settings,
            docs_root,
        }
    }

    /// Settings the run executes under: its embedded snapshot when present,
    /// else the runner's effective settings.
    pub(crate) fn run_settings(&self, run: &Run) -> Value {
        match run.input.get("settings_snapshot") {
            Some(snapshot) if snapshot.is_object() => snapshot.clone(),
            _ => self.settings.clone(),
        }
    }

    pub async fn execute(
        &self,
        run: &Run,
        heartbeat: &dyn HeartbeatFn,
    ) -> Result<Value, ExecuteError> {
        let mut ctx = TaskContext::new(run, &run.run_type);
        let outcome = match run.run_type.as_str() {
            "sleep" => sleep::handle(&mut ctx, heartbeat).await,
            "summarize_conversation" => self.handle_summarize(&mut ctx, heartbeat).await,
            "research_report" => self.handle_research_report(run, &mut ctx, heartbeat).await,
            "run_code_snippet" => self.handle_run_code_snippet(run, &mut ctx, heartbeat).await,
            "agent_loop_turn" => self.handle_agent_loop_turn(run, &mut ctx, heartbeat).await,
            "edit_docs_propose" => self.handle_edit_docs_propose(&mut ctx).await,
            "edit_docs_apply" => self.handle_edit_docs_apply(&mut ctx).await,
            "edit_docs_cancel" => self.handle_edit_docs_cancel(&mut ctx).await,
            other => {
                return Err(ExecuteError::Invalid(format!("Unknown task type: {other}")));
            }
        };
        match outcome {
            Ok(()) | Err(HandlerError::Task) => {
                let envelope = ctx.build_output();
                Ok(serde_json::to_value(envelope).unwrap_or(Value::Null))
            }
            Err(HandlerError::Canceled) => Err(ExecuteError::Canceled),
            Err(HandlerError::LeaseLost) => Err(ExecuteError::LeaseLost),
            Err(HandlerError::Invalid(message)) => Err(ExecuteError::Invalid(message)),
        }
    }
}
