use std::path::{Component, Path};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::path_adapter::HostPathAdapter;
use crate::policy::{merge_policy, SandboxPolicy};
use crate::SandboxError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecStatus {
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "POLICY_DENIED")]
    PolicyDenied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInput {
    /// Relative to the exec's `inputs/` directory; traversal is rejected.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub project_id: String,
    pub skill_id: Option<String>,
    /// `shell` or `python`.
    pub exec_kind: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub inputs: Vec<ExecInput>,
    #[serde(default)]
    pub manifest_limits: Option<Value>,
    #[serde(default)]
    pub policy_overrides: Option<Value>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn default_cwd() -> String {
    "work".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exec_id: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    /// Relative to the workspace root, `projects/<project>/artifacts/<exec_id>`.
    pub artifacts_dir: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<Value>,
}

/// Reject absolute paths and any `..` component in an exec input path.
pub fn validate_input_path(path: &str) -> Result<&str, SandboxError> {
    let raw = Path::new(path);
    if raw.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(SandboxError::InvalidArgument(format!(
            "path traversal not allowed: {path}"
        )));
    }
    if raw
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(SandboxError::InvalidArgument(format!(
            "path traversal not allowed: {path}"
        )));
    }
    Ok(path)
}

/// Exec shape policy: shell runs exactly `bash -lc <script>`, python runs
/// `python -c <code>` or one safe script under `/workspace/inputs/`.
pub fn validate_exec_kind_command(req: &ExecRequest) -> Result<(), SandboxError> {
    match req.exec_kind.as_str() {
        "shell" => {
            if req.command != "bash" {
                return Err(SandboxError::PolicyDenied(
                    "shell exec command must be bash".to_string(),
                ));
            }
            if req.args.len() != 2 || req.args[0] != "-lc" {
                return Err(SandboxError::PolicyDenied(
                    "shell exec args must be [-lc, <script>]".to_string(),
                ));
            }
            Ok(())
        }
        "python" => {
            if req.command != "python" {
                return Err(SandboxError::PolicyDenied(
                    "python exec command must be python".to_string(),
                ));
            }
            if req.args.len() == 2 && req.args[0] == "-c" {
                return Ok(());
            }
            if req.args.len() == 1 {
                let script = &req.args[0];
                if let Some(relative) = script.strip_prefix("/workspace/inputs/") {
                    validate_input_path(relative)?;
                    return Ok(());
                }
            }
            Err(SandboxError::PolicyDenied(
                "python exec args must be [-c, <code>] or [/workspace/inputs/<path>]".to_string(),
            ))
        }
        other => Err(SandboxError::PolicyDenied(format!(
            "exec kind must be shell or python, got {other}"
        ))),
    }
}

/// Runs skills inside a container under a merged policy, bounded by
/// `max_concurrent_execs`.
pub struct SandboxRunner {
    settings: Value,
    docker_cli: String,
    image: String,
    semaphore: Arc<Semaphore>,
}

impl SandboxRunner {
    pub fn new(settings: Value) -> Self {
        let docker = settings
            .pointer("/sandbox/docker/cli_path")
            .and_then(|v| v.as_str())
            .unwrap_or("docker")
            .to_string();
        let image = settings
            .pointer("/sandbox/docker/image")
            .and_then(|v| v.as_str())
            .unwrap_or("ferrite-sandbox:py312")
            .to_string();
        let base_policy = merge_policy(settings.pointer("/sandbox/policy"), None, None);
        Self {
            settings,
            docker_cli: docker,
            image,
            semaphore: Arc::new(Semaphore::new(base_policy.max_concurrent_execs.max(1))),
        }
    }

    fn effective_policy(&self, req: &ExecRequest) -> SandboxPolicy {
        merge_policy(
            self.settings.pointer("/sandbox/policy"),
            req.manifest_limits.as_ref(),
            req.policy_overrides.as_ref(),
        )
    }

    pub async fn exec(&self, req: ExecRequest) -> Result<ExecResponse, SandboxError> {
        validate_exec_kind_command(&req)?;
        for input in &req.inputs {
            validate_input_path(&input.path)?;
        }
        let policy = self.effective_policy(&req);
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Runtime("exec semaphore closed".to_string()))?;

        let adapter = HostPathAdapter::from_settings(&self.settings);
        let exec_id = format!("e_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let artifacts_rel = format!("projects/{}/artifacts/{}", req.project_id, exec_id);
        let exec_rel = format!("projects/{}/execs/{}", req.project_id, exec_id);
        let artifacts_native = adapter.host_path_native(&[artifacts_rel.as_str()])?;
        let exec_native = adapter.host_path_native(&[exec_rel.as_str()])?;
        let inputs_native = exec_native.join("inputs");
        let work_native = exec_native.join(&req.cwd);

        for dir in [&artifacts_native, &inputs_native, &work_native] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SandboxError::Runtime(format!("create workspace dirs: {e}")))?;
        }
        for input in &req.inputs {
            let target = inputs_native.join(&input.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::Runtime(format!("create input dirs: {e}")))?;
            }
            tokio::fs::write(&target, input.content.as_bytes())
                .await
                .map_err(|e| SandboxError::Runtime(format!("write input {}: {e}", input.path)))?;
        }

        let mount = adapter.docker_mount_path(&[exec_rel.as_str()])?;
        let started_at = Utc::now();
        let mut command = Command::new(&self.docker_cli);
        command
            .arg("run")
            .arg("--rm")
            .arg("--network")
            .arg(&policy.net_mode)
            .arg("--memory")
            .arg(format!("{}m", policy.memory_mb))
            .arg("--cpus")
            .arg(format!("{}", policy.cpu_cores))
            .arg("--pids-limit")
            .arg(format!("{}", policy.pids))
            .arg("-v")
            .arg(format!("{mount}:/workspace"))
            .arg("-w")
            .arg(format!("/workspace/{}", req.cwd));
        if let Some(env) = &req.env {
            for (key, value) in env {
                command.arg("-e").arg(format!("{key}={value}"));
            }
        }
        command.arg(&self.image).arg(&req.command).args(&req.args);
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("docker spawn failed: {e}")))?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, policy.max_stdout_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, policy.max_stderr_bytes));

        let timeout = Duration::from_millis(policy.timeout_ms);
        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => {
                return Err(SandboxError::Runtime(format!("docker wait failed: {e}")));
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, true)
            }
        };

        let (stdout_bytes, stdout_truncated) = stdout_task
            .await
            .map_err(|e| SandboxError::Runtime(format!("stdout capture: {e}")))?;
        let (stderr_bytes, stderr_truncated) = stderr_task
            .await
            .map_err(|e| SandboxError::Runtime(format!("stderr capture: {e}")))?;

        let stdout_path = artifacts_native.join("stdout.txt");
        let stderr_path = artifacts_native.join("stderr.txt");
        tokio::fs::write(&stdout_path, &stdout_bytes)
            .await
            .map_err(|e| SandboxError::Runtime(format!("write stdout.txt: {e}")))?;
        tokio::fs::write(&stderr_path, &stderr_bytes)
            .await
            .map_err(|e| SandboxError::Runtime(format!("write stderr.txt: {e}")))?;

        let exit_code = status.and_then(|s| s.code());
        let (exec_status, error_reason) = if timed_out {
            (
                ExecStatus::Timeout,
                Some(json!({"code": "TIMEOUT", "message": format!("exec exceeded {} ms", policy.timeout_ms)})),
            )
        } else if exit_code == Some(0) {
            (ExecStatus::Succeeded, None)
        } else {
            (ExecStatus::Failed, None)
        };

        let meta = json!({
            "exec_id": exec_id,
            "project_id": req.project_id,
            "skill_id": req.skill_id,
            "exec_kind": req.exec_kind,
            "command": req.command,
            "args": req.args,
            "cwd": req.cwd,
            "status": exec_status,
            "exit_code": exit_code,
            "policy_snapshot": policy,
            "started_at": started_at.to_rfc3339(),
            "ended_at": Utc::now().to_rfc3339(),
            "duration_ms": (Utc::now() - started_at).num_milliseconds(),
            "stdout_truncated": stdout_truncated,
            "stderr_truncated": stderr_truncated,
        });
        let meta_path = artifacts_native.join("meta.json");
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta).unwrap_or_default())
            .await
            .map_err(|e| SandboxError::Runtime(format!("write meta.json: {e}")))?;

        Ok(ExecResponse {
            exec_id,
            status: exec_status,
            exit_code,
            artifacts_dir: artifacts_rel,
            stdout_path: "stdout.txt".to_string(),
            stderr_path: "stderr.txt".to_string(),
            stdout_truncated,
            stderr_truncated,
            error_reason,
        })
    }
}

/// Drain a pipe up to `cap` bytes. Past the cap the stream is no longer
/// read; the process is still allowed to finish. Returns the captured bytes
/// and whether the cap was hit.
async fn read_capped<R>(pipe: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return (Vec::new(), false);
    };
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => return (captured, false),
            Ok(n) => {
                let remaining = cap.saturating_sub(captured.len());
                if n < remaining {
                    captured.extend_from_slice(&buf[..n]);
                    continue;
                }
                captured.extend_from_slice(&buf[..remaining]);
                if n > remaining {
                    return (captured, true);
                }
                // landed exactly on the cap: truncated only if more follows
                let mut probe = [0u8; 1];
                let more = matches!(pipe.read(&mut probe).await, Ok(p) if p > 0);
                return (captured, more);
            }
            Err(_) => return (captured, false),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn shell_req(script: &str) -> ExecRequest {
        ExecRequest {
            project_id: "p1".to_string(),
            skill_id: Some("shell.run".to_string()),
            exec_kind: "shell".to_string(),
            command: "bash".to_string(),
            args: vec!["-lc".to_string(), script.to_string()],
            cwd: "work".to_string(),
            env: None,
            inputs: vec![],
            manifest_limits: None,
            policy_overrides: None,
            task_id: None,
            conversation_id: None,
        }
    }

    #[test]
    fn input_path_rejects_traversal_and_absolute() {
        assert!(validate_input_path("../hack.txt").is_err());
        assert!(validate_input_path("a/../../b.txt").is_err());
        assert!(validate_input_path("/etc/passwd").is_err());
        assert!(validate_input_path("input.txt").is_ok());
        assert!(validate_input_path("a/b.txt").is_ok());
    }

    #[test]
    fn shell_shape_is_enforced() {
        assert!(validate_exec_kind_command(&shell_req("echo 1")).is_ok());

        let mut wrong_cmd = shell_req("echo 1");
        wrong_cmd.command = "sh".to_string();
        let err = validate_exec_kind_command(&wrong_cmd).unwrap_err();
        assert_eq!(err.code(), "POLICY_DENIED");

        let mut wrong_args = shell_req("echo 1");
        wrong_args.args = vec!["echo".to_string(), "1".to_string()];
        assert!(validate_exec_kind_command(&wrong_args).is_err());
    }

    #[test]
    fn python_shape_allows_inline_and_safe_script() {
        let mut req = shell_req("");
        req.exec_kind = "python".to_string();
        req.command = "python".to_string();
        req.args = vec!["-c".to_string(), "print(1)".to_string()];
        assert!(validate_exec_kind_command(&req).is_ok());

        req.args = vec!["/workspace/inputs/main.py".to_string()];
        assert!(validate_exec_kind_command(&req).is_ok());

        req.args = vec!["/workspace/inputs/../escape.py".to_string()];
        assert!(validate_exec_kind_command(&req).is_err());

        req.command = "python3".to_string();
        req.args = vec!["-c".to_string(), "print(1)".to_string()];
        assert!(validate_exec_kind_command(&req).is_err());
    }

    #[test]
    fn unknown_kind_is_denied() {
        let mut req = shell_req("");
        req.exec_kind = "node".to_string();
        let err = validate_exec_kind_command(&req).unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn read_capped_truncates_at_cap() {
        let data = vec![b'x'; 100];
        let (bytes, truncated) = read_capped(Some(&data[..]), 100).await;
        assert_eq!(bytes.len(), 100);
        assert!(!truncated);

        let (bytes, truncated) = read_capped(Some(&data[..]), 99).await;
        assert_eq!(bytes.len(), 99);
        assert!(truncated);
    }
}
