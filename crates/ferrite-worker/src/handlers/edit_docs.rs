use std::path::PathBuf;

use serde_json::json;

use ferrite_types::TaskError;

use crate::diff::{apply_unified_diff, build_unified_diff, patch_id};
use crate::handlers::{HandlerError, TaskRunner};
use crate::task_context::TaskContext;

const PATCH_ID_SHORT_LEN: usize = 16;

impl TaskRunner {
    fn resolve_doc_path(&self, target_path: &str) -> Result<PathBuf, HandlerError> {
        let relative = target_path.trim().trim_start_matches(['/', '\\']);
        if relative.is_empty() {
            return Err(HandlerError::Invalid(
                "input 'target_path' is required".to_string(),
            ));
        }
        let candidate = PathBuf::from(relative);
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(HandlerError::Invalid(
                "input 'target_path' must not traverse upwards".to_string(),
            ));
        }
        Ok(self.docs_root.join(candidate))
    }

    /// Phase one of the two-phase edit: compute the unified diff and its
    /// fingerprint, then park in `WAIT_CONFIRM` until an apply or cancel
    /// run references this one as parent.
    pub(crate) async fn handle_edit_docs_propose(
        &self,
        ctx: &mut TaskContext,
    ) -> Result<(), HandlerError> {
        let target_path = ctx
            .input
            .get("target_path")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| HandlerError::Invalid("input 'target_path' is required".to_string()))?;
        let new_content = ctx
            .input
            .get("new_content")
            .or_else(|| ctx.input.get("content"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let instructions = ctx
            .input
            .get("instructions")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let path = self.resolve_doc_path(&target_path)?;

        let mut step = ctx.step("read_file");
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                let task_err = TaskError::new("IoError", err.to_string(), "read_file");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        step.meta
            .insert("bytes".to_string(), json!(current.len()));
        ctx.complete_step(step);

        let step = ctx.step("propose_patch");
        let proposed = match new_content {
            Some(content) => content,
            None => match instructions {
                Some(instructions) => {
                    let prompt = format!(
                        "Rewrite the document below according to the instructions.\n\
                         Return ONLY the full new document text.\n\n\
                         Instructions: {instructions}\n\n---\n{current}"
                    );
                    match self.llm.generate(&prompt).await {
                        Ok(text) => text,
                        Err(err) => {
                            let task_err =
                                TaskError::new("RuntimeError", err.to_string(), "propose_patch");
                            ctx.fail_step(step, &task_err);
                            return Err(HandlerError::Task);
                        }
                    }
                }
                None => {
                    return Err(HandlerError::Invalid(
                        "input requires 'new_content' or 'instructions'".to_string(),
                    ));
                }
            },
        };
        let mut proposed = proposed;
        if !proposed.is_empty() && !proposed.ends_with('\n') {
            proposed.push('\n');
        }
        let diff = build_unified_diff(&current, &proposed, target_path.trim_start_matches('/'));
        let full_patch_id = patch_id(&diff);
        ctx.complete_step(step);

        let mut step = ctx.step("present_diff");
        step.meta.insert(
            "patch_id_short".to_string(),
            json!(&full_patch_id[..PATCH_ID_SHORT_LEN]),
        );
        ctx.complete_step(step);

        ctx.artifacts.insert("diff".to_string(), json!(diff));
        ctx.artifacts
            .insert("patch_id".to_string(), json!(full_patch_id));
        ctx.artifacts.insert(
            "patch_id_short".to_string(),
            json!(&full_patch_id[..PATCH_ID_SHORT_LEN]),
        );
        ctx.artifacts
            .insert("files".to_string(), json!([target_path]));
        ctx.artifacts.insert("applied".to_string(), json!(false));
        ctx.result
            .insert("task_state".to_string(), json!("WAIT_CONFIRM"));
        Ok(())
    }

    /// Phase two: verify the (possibly short-form) patch id against the
    /// propose run's stored fingerprint, then apply the diff.
    pub(crate) async fn handle_edit_docs_apply(
        &self,
        ctx: &mut TaskContext,
    ) -> Result<(), HandlerError> {
        let (parent, input_patch_id) = self.load_parent_patch(ctx).await?;

        let step = ctx.step("verify_patch");
        let parent_patch_id = parent
            .pointer("/artifacts/patch_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if input_patch_id.is_empty()
            || parent_patch_id.is_empty()
            || !parent_patch_id.starts_with(&input_patch_id)
        {
            let task_err = TaskError::new(
                "PatchMismatch",
                format!(
                    "patch_id {:?} does not match the proposed patch",
                    input_patch_id
                ),
                "verify_patch",
            );
            ctx.fail_step(step, &task_err);
            return Err(HandlerError::Task);
        }
        ctx.complete_step(step);

        let diff = parent
            .pointer("/artifacts/diff")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let files: Vec<String> = parent
            .pointer("/artifacts/files")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let Some(target_path) = files.first().cloned() else {
            return Err(HandlerError::Invalid(
                "propose run has no files recorded".to_string(),
            ));
        };
        let path = self.resolve_doc_path(&target_path)?;

        let mut step = ctx.step("apply_patch");
        let current = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let updated = match apply_unified_diff(&current, &diff) {
            Ok(updated) => updated,
            Err(err) => {
                let task_err = TaskError::new("PatchMismatch", err.to_string(), "apply_patch");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        if let Some(parent_dir) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent_dir).await;
        }
        if let Err(err) = tokio::fs::write(&path, updated.as_bytes()).await {
            let task_err = TaskError::new("IoError", err.to_string(), "apply_patch");
            ctx.fail_step(step, &task_err);
            return Err(HandlerError::Task);
        }
        step.meta.insert("bytes".to_string(), json!(updated.len()));
        ctx.complete_step(step);

        ctx.artifacts
            .insert("patch_id".to_string(), json!(parent_patch_id));
        ctx.artifacts.insert(
            "patch_id_short".to_string(),
            json!(&parent_patch_id[..PATCH_ID_SHORT_LEN.min(parent_patch_id.len())]),
        );
        ctx.artifacts.insert("files".to_string(), json!(files));
        ctx.artifacts.insert("applied".to_string(), json!(true));
        Ok(())
    }

    /// Abandon a proposed patch; echoes the fingerprint so the UI can tie
    /// the cancel to its propose.
    pub(crate) async fn handle_edit_docs_cancel(
        &self,
        ctx: &mut TaskContext,
    ) -> Result<(), HandlerError> {
        let (parent, _) = self.load_parent_patch(ctx).await?;
        let parent_run_id = ctx
            .input
            .get("parent_run_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let step = ctx.step("cancel");
        let parent_patch_id = parent
            .pointer("/artifacts/patch_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        ctx.complete_step(step);

        ctx.artifacts
            .insert("patch_id".to_string(), json!(parent_patch_id));
        ctx.artifacts.insert("canceled".to_string(), json!(true));
        ctx.artifacts.insert("applied".to_string(), json!(false));
        ctx.result
            .insert("parent_run_id".to_string(), json!(parent_run_id));
        Ok(())
    }

    /// Shared propose-run lookup for apply/cancel: `load_parent` step plus
    /// the request's patch id (possibly short form).
    async fn load_parent_patch(
        &self,
        ctx: &mut TaskContext,
    ) -> Result<(serde_json::Value, String), HandlerError> {
        let parent_run_id = ctx
            .input
            .get("parent_run_id")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                HandlerError::Invalid("input 'parent_run_id' is required".to_string())
            })?;
        let input_patch_id = ctx
            .input
            .get("patch_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        let step = ctx.step("load_parent");
        let parent = match self.store.get_run(&parent_run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                let task_err = TaskError::new(
                    "InvalidInput",
                    format!("parent run not found: {parent_run_id}"),
                    "load_parent",
                );
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
            Err(err) => {
                let task_err = TaskError::new("StoreError", err.to_string(), "load_parent");
                ctx.fail_step(step, &task_err);
                return Err(HandlerError::Task);
            }
        };
        let Some(output) = parent.output else {
            let task_err = TaskError::new(
                "InvalidInput",
                format!("parent run {parent_run_id} has no output"),
                "load_parent",
            );
            ctx.fail_step(step, &task_err);
            return Err(HandlerError::Task);
        };
        ctx.complete_step(step);
        Ok((output, input_patch_id))
    }
}
