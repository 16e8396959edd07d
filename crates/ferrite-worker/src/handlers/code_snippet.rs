use std::sync::Arc;

use serde_json::{json, Value};

use ferrite_types::Run;

use crate::handlers::{HandlerError, HeartbeatFn, TaskRunner};
use crate::task_context::TaskContext;
use crate::tools::{build_catalog_from_settings, ToolRuntime};

const STDOUT_PREVIEW_MAX: usize = 2000;

impl TaskRunner {
    /// One sandboxed execution through the skills provider
    /// (`skill.python.run` / `skill.shell.run`). The result carries
    /// `{exec_id, status, exit_code, observation}` plus a composed `reply`
    /// for the UI, with the stdout preview inline.
    pub(crate) async fn handle_run_code_snippet(
        &self,
        run: &Run,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
    ) -> Result<(), HandlerError> {
        if ctx.conversation_id.is_none() {
            return Err(HandlerError::Invalid(
                "input 'conversation_id' is required".to_string(),
            ));
        }
        let language = ctx
            .input
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let (tool_name, payload_key, payload) = match language.as_str() {
            "python" => {
                let code = ctx
                    .input
                    .get("code")
                    .or_else(|| ctx.input.get("script"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string);
                ("skill.python.run", "code", code)
            }
            "shell" => {
                let script = ctx
                    .input
                    .get("script")
                    .or_else(|| ctx.input.get("code"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string);
                ("skill.shell.run", "script", script)
            }
            other => {
                return Err(HandlerError::Invalid(format!(
                    "input 'language' must be python or shell, got {other:?}"
                )));
            }
        };
        let Some(payload) = payload.filter(|p| !p.trim().is_empty()) else {
            return Err(HandlerError::Invalid(format!(
                "input '{payload_key}' is required for language {language}"
            )));
        };

        let settings = self.run_settings(run);
        let catalog = Arc::new(build_catalog_from_settings(&settings));
        let runtime = ToolRuntime::new(catalog.clone());

        let mut args = json!({payload_key: payload});
        if let Some(timeout_ms) = ctx.input.get("timeout_ms").and_then(|v| v.as_u64()) {
            args["timeout_ms"] = json!(timeout_ms);
        }
        let invoke_result = runtime
            .invoke(ctx, tool_name, args, Some(self.llm.as_ref()))
            .await;
        catalog.close_providers().await;
        heartbeat.beat().await?;

        let exec = match invoke_result {
            Ok(value) => value,
            Err(_) => return Err(HandlerError::Task),
        };

        let status = exec
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("FAILED")
            .to_string();
        let exit_code = exec.get("exit_code").and_then(|v| v.as_i64());
        let stdout_preview: String = exec
            .get("stdout_preview")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .chars()
            .take(STDOUT_PREVIEW_MAX)
            .collect();

        let observation = json!({
            "status": status,
            "exit_code": exit_code,
            "stdout_preview": stdout_preview,
            "stderr_preview": exec.get("stderr_preview").and_then(|v| v.as_str()).unwrap_or(""),
        });
        let reply = if stdout_preview.trim().is_empty() {
            format!(
                "Execution {status} (exit_code={})",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
            )
        } else {
            format!(
                "Execution {status} (exit_code={})\n\n```\n{}\n```",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                stdout_preview.trim_end()
            )
        };

        ctx.result
            .insert("exec_id".to_string(), exec.get("exec_id").cloned().unwrap_or(Value::Null));
        ctx.result.insert("status".to_string(), json!(status));
        ctx.result.insert("exit_code".to_string(), json!(exit_code));
        ctx.result.insert("observation".to_string(), observation);
        ctx.result.insert("reply".to_string(), json!(reply));
        if let Some(artifacts_dir) = exec.get("artifacts_dir") {
            ctx.artifacts
                .insert("artifacts_dir".to_string(), artifacts_dir.clone());
        }

        if status != "SUCCEEDED" {
            let step = ctx.step("exec_status");
            let err = ferrite_types::TaskError::new(
                "RUNTIME_ERROR",
                format!("sandbox exec ended with status {status}"),
                "exec_status",
            );
            ctx.fail_step(step, &err);
            return Err(HandlerError::Task);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{runner, running_run};
    use crate::handlers::NoopHeartbeat;
    use ferrite_store::Store;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal skills endpoint: GET /skills lists python.run/shell.run,
    /// POST /skills/{id}/invoke answers with a fixed exec response.
    async fn spawn_skills_stub(invoke_body: serde_json::Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let invoke_body = invoke_body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16384];
                    let mut read = 0usize;
                    // read until end of headers, then drain content-length
                    loop {
                        let Ok(n) = socket.read(&mut buf[read..]).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        read += n;
                        let head = String::from_utf8_lossy(&buf[..read]);
                        if let Some(header_end) = head.find("\r\n\r\n") {
                            let content_length = head
                                .lines()
                                .find(|l| l.to_lowercase().starts_with("content-length:"))
                                .and_then(|l| l.split(':').nth(1))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if read >= header_end + 4 + content_length {
                                break;
                            }
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]);
                    let body = if head.starts_with("GET /skills") {
                        serde_json::json!([
                            {"id": "python.run", "name": "Run Python", "interface": {"inputs": {}}, "limits": {}},
                            {"id": "shell.run", "name": "Run Shell", "interface": {"inputs": {}}, "limits": {}},
                        ])
                        .to_string()
                    } else {
                        invoke_body.to_string()
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    async fn runner_with_skills(base_url: &str) -> TaskRunner {
        let store = Store::open_in_memory().await.unwrap();
        let mut r = runner(store);
        r.settings = json!({
            "web": {"search": {"backend": "stub"}, "fetch": {"backend": "stub"}},
            "skills": {"base_url": base_url, "list_fallback": false},
        });
        r
    }

    #[tokio::test]
    async fn python_exec_result_and_step() {
        let base = spawn_skills_stub(json!({
            "exec_id": "e_test123",
            "status": "SUCCEEDED",
            "exit_code": 0,
            "artifacts_dir": "projects/conv-1/artifacts/e_test123",
            "stdout_preview": "1\n",
        }))
        .await;
        let runner = runner_with_skills(&base).await;
        let run = running_run(
            "run_code_snippet",
            json!({"conversation_id": "conv-1", "language": "python", "code": "print(1)"}),
        );
        let mut ctx = TaskContext::new(&run, "run_code_snippet");
        runner
            .handle_run_code_snippet(&run, &mut ctx, &NoopHeartbeat)
            .await
            .unwrap();
        let out = ctx.build_output();
        assert!(out.ok);
        assert_eq!(out.result["exec_id"], "e_test123");
        assert_eq!(out.result["status"], "SUCCEEDED");
        assert_eq!(out.result["exit_code"], 0);
        assert_eq!(out.result["observation"]["exit_code"], 0);
        let reply = out.result["reply"].as_str().unwrap();
        assert!(reply.contains("SUCCEEDED"));
        assert!(reply.contains("1"));
        let names: Vec<&str> = out.steps.iter().map(|s| s.name.as_str()).collect();
        assert!(names.iter().any(|n| n.contains("skill.python.run")));
    }

    #[tokio::test]
    async fn shell_uses_shell_run_tool() {
        let base = spawn_skills_stub(json!({
            "exec_id": "e_shell",
            "status": "SUCCEEDED",
            "exit_code": 0,
        }))
        .await;
        let runner = runner_with_skills(&base).await;
        let run = running_run(
            "run_code_snippet",
            json!({"conversation_id": "c2", "language": "shell", "script": "echo hello"}),
        );
        let mut ctx = TaskContext::new(&run, "run_code_snippet");
        runner
            .handle_run_code_snippet(&run, &mut ctx, &NoopHeartbeat)
            .await
            .unwrap();
        let out = ctx.build_output();
        assert_eq!(out.result["exec_id"], "e_shell");
        let names: Vec<&str> = out.steps.iter().map(|s| s.name.as_str()).collect();
        assert!(names.iter().any(|n| n.contains("skill.shell.run")));
    }

    #[tokio::test]
    async fn failed_exec_status_fails_the_envelope() {
        let base = spawn_skills_stub(json!({
            "exec_id": "e_boom",
            "status": "FAILED",
            "exit_code": 2,
            "stdout_preview": "",
        }))
        .await;
        let runner = runner_with_skills(&base).await;
        let run = running_run(
            "run_code_snippet",
            json!({"conversation_id": "c3", "language": "python", "code": "sys.exit(2)"}),
        );
        let mut ctx = TaskContext::new(&run, "run_code_snippet");
        let err = runner
            .handle_run_code_snippet(&run, &mut ctx, &NoopHeartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Task));
        let out = ctx.build_output();
        assert!(!out.ok);
        assert_eq!(out.result["status"], "FAILED");
        assert_eq!(out.error.unwrap().code, "RUNTIME_ERROR");
    }

    #[tokio::test]
    async fn missing_conversation_id_is_invalid() {
        let runner = crate::handlers::test_support::runner_in_memory().await;
        let run = running_run(
            "run_code_snippet",
            json!({"language": "python", "code": "print(1)"}),
        );
        let mut ctx = TaskContext::new(&run, "run_code_snippet");
        let err = runner
            .handle_run_code_snippet(&run, &mut ctx, &NoopHeartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
    }

    #[tokio::test]
    async fn unknown_language_is_invalid() {
        let runner = crate::handlers::test_support::runner_in_memory().await;
        let run = running_run(
            "run_code_snippet",
            json!({"conversation_id": "c", "language": "node", "code": "1"}),
        );
        let mut ctx = TaskContext::new(&run, "run_code_snippet");
        let err = runner
            .handle_run_code_snippet(&run, &mut ctx, &NoopHeartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
    }
}
