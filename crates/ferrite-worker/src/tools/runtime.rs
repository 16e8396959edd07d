use serde_json::Value;
use std::sync::Arc;

use ferrite_providers::Llm;

use crate::task_context::TaskContext;
use crate::tools::{InvokeScope, ToolCatalog, ToolError};

const PREVIEW_MAX: usize = 200;

/// Bounded, JSON-safe preview for step metadata. Never panics.
pub fn preview(value: &Value, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }
    let raw = match value {
        Value::Null => return String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unable to preview>".to_string()),
    };
    if raw.chars().count() > limit {
        let clipped: String = raw.chars().take(limit).collect();
        format!("{clipped}…")
    } else {
        raw
    }
}

/// Multi-provider tool invocation: resolve through the catalog, run inside
/// exactly one `tool.<name>` step, and record argument/result previews.
pub struct ToolRuntime {
    catalog: Arc<ToolCatalog>,
}

impl ToolRuntime {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub async fn invoke(
        &self,
        ctx: &mut TaskContext,
        name: &str,
        args: Value,
        llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        let step_name = format!("tool.{name}");
        let mut step = ctx.step(&step_name);

        let meta = match self.catalog.get(name).await {
            Some(meta) => meta,
            None => {
                let err = ToolError::not_found(name, "not in catalog");
                ctx.fail_step(step, &err);
                return Err(err);
            }
        };
        let provider = match self.catalog.get_provider(&meta.provider_id) {
            Some(provider) => provider,
            None => {
                let err = ToolError::not_found(
                    name,
                    &format!("provider {} not registered", meta.provider_id),
                );
                ctx.fail_step(step, &err);
                return Err(err);
            }
        };

        step.meta
            .insert("args_preview".to_string(), Value::String(preview(&args, PREVIEW_MAX)));
        step.meta
            .insert("tool_name".to_string(), Value::String(name.to_string()));
        step.meta.insert(
            "provider_id".to_string(),
            Value::String(meta.provider_id.clone()),
        );
        step.meta.insert(
            "risk_level".to_string(),
            serde_json::to_value(meta.risk_level).unwrap_or(Value::Null),
        );
        step.meta.insert(
            "capability_level".to_string(),
            serde_json::to_value(meta.capability_level).unwrap_or(Value::Null),
        );

        let run_id = ctx.run_id.clone();
        let conversation_id = ctx.conversation_id.clone();
        let artifact_dir = ctx.artifact_dir.clone();
        let scope = InvokeScope {
            run_id: &run_id,
            conversation_id: conversation_id.as_deref(),
            artifact_dir: artifact_dir.as_deref(),
        };

        match provider.invoke(name, &args, scope, llm).await {
            Ok(result) => {
                step.meta.insert(
                    "result_preview".to_string(),
                    Value::String(preview(&result, PREVIEW_MAX)),
                );
                ctx.complete_step(step);
                Ok(result)
            }
            Err(err) => {
                step.meta.insert(
                    "result_preview".to_string(),
                    Value::String("(error)".to_string()),
                );
                ctx.fail_step(step, &err);
                Err(err)
            }
        }
    }
}
