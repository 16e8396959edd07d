use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::McpError;

const CLOSE_TERMINATE_WAIT: Duration = Duration::from_secs(2);
const CLOSE_KILL_WAIT: Duration = Duration::from_secs(1);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

struct ProcessState {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

/// Minimal JSON-RPC over stdio: one JSON object per line, responses matched
/// by request id. A reader task owned by the client resolves per-id oneshot
/// channels and is torn down in `close()`.
pub struct McpStdioClient {
    cmd: Vec<String>,
    cwd: Option<String>,
    state: Mutex<Option<ProcessState>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl McpStdioClient {
    pub fn new(cmd: Vec<String>, cwd: Option<String>) -> Self {
        Self {
            cmd,
            cwd,
            state: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn drain_pending(pending: &Pending, reason: &str) {
        let mut guard = pending.lock().await;
        for (_, sender) in guard.drain() {
            let _ = sender.send(Err(McpError::Connection(reason.to_string())));
        }
    }

    fn spawn_reader(stdout: tokio::process::ChildStdout, pending: Pending) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(message) = serde_json::from_str::<Value>(line) else {
                            continue;
                        };
                        let Some(id) = message.get("id").and_then(|v| v.as_u64()) else {
                            continue;
                        };
                        let sender = pending.lock().await.remove(&id);
                        let Some(sender) = sender else {
                            continue;
                        };
                        let outcome = if let Some(error) = message.get("error") {
                            Err(McpError::Connection(
                                error
                                    .get("message")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("unknown")
                                    .to_string(),
                            ))
                        } else {
                            Ok(message.get("result").cloned().unwrap_or(Value::Null))
                        };
                        let _ = sender.send(outcome);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            Self::drain_pending(&pending, "connection closed").await;
        })
    }

    async fn ensure_process(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Connection("client closed".to_string()));
        }
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_mut() {
            match existing.child.try_wait() {
                Ok(Some(_)) => return Err(McpError::Connection("process exited".to_string())),
                Ok(None) => return Ok(()),
                Err(err) => return Err(McpError::Connection(err.to_string())),
            }
        }
        if self.cmd.is_empty() {
            return Err(McpError::SpawnFailed("empty command".to_string()));
        }
        let mut command = Command::new(&self.cmd[0]);
        command
            .args(&self.cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|err| McpError::SpawnFailed(err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("no stdout pipe".to_string()))?;
        let reader = Self::spawn_reader(stdout, self.pending.clone());
        *state = Some(ProcessState {
            child,
            stdin,
            reader,
        });
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, McpError> {
        self.ensure_process().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut line = serde_json::to_string(&request)
            .map_err(|err| McpError::Connection(err.to_string()))?;
        line.push('\n');
        {
            let mut state = self.state.lock().await;
            let Some(state) = state.as_mut() else {
                self.pending.lock().await.remove(&id);
                return Err(McpError::Connection("no process".to_string()));
            };
            if let Err(err) = state.stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(McpError::Connection(err.to_string()));
            }
            let _ = state.stdin.flush().await;
        }

        let timeout = Duration::from_millis(if timeout_ms == 0 { 30_000 } else { timeout_ms });
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Connection("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout("request timeout".to_string()))
            }
        }
    }

    /// `tools/list`; malformed results degrade to an empty list.
    pub async fn list_tools(&self, timeout_ms: u64) -> Result<Vec<Value>, McpError> {
        let result = self.request("tools/list", json!({}), timeout_ms).await?;
        let tools = result
            .get("tools")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter(|t| t.get("name").and_then(|v| v.as_str()).is_some())
            .collect())
    }

    /// `tools/call` with the bare (un-namespaced) tool name.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        timeout_ms: u64,
    ) -> Result<Value, McpError> {
        let result = self
            .request(
                "tools/call",
                json!({"name": name, "arguments": args}),
                timeout_ms,
            )
            .await?;
        if result.is_object() {
            Ok(result)
        } else {
            Ok(json!({"result": result}))
        }
    }

    /// Stop the reader, close stdin, give the process a grace period to
    /// exit, then kill. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state.lock().await.take();
        if let Some(mut state) = state {
            drop(state.stdin);
            let exited = tokio::time::timeout(CLOSE_TERMINATE_WAIT, state.child.wait())
                .await
                .is_ok();
            if !exited {
                let _ = state.child.start_kill();
                let _ = tokio::time::timeout(CLOSE_KILL_WAIT, state.child.wait()).await;
            }
            state.reader.abort();
        }
        Self::drain_pending(&self.pending, "client closed").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_types::ErrorCode;

    #[tokio::test]
    async fn missing_executable_is_spawn_failed() {
        let client = McpStdioClient::new(vec!["/nonexistent/mcp-server".to_string()], None);
        let err = client.list_tools(1000).await.unwrap_err();
        assert_eq!(err.code(), "SpawnFailed");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_requests() {
        let client = McpStdioClient::new(vec!["/nonexistent/mcp-server".to_string()], None);
        client.close().await;
        client.close().await;
        let err = client.list_tools(1000).await.unwrap_err();
        assert_eq!(err.code(), "ConnectionError");
    }

    #[tokio::test]
    async fn echo_server_round_trip() {
        // A tiny line-oriented JSON-RPC echo written in shell: replies to
        // tools/list with one tool.
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo"}]}}\n' "$id"
done
"#;
        let client = McpStdioClient::new(
            vec!["bash".to_string(), "-c".to_string(), script.to_string()],
            None,
        );
        let tools = client.list_tools(5000).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        client.close().await;
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let client = McpStdioClient::new(
            vec!["bash".to_string(), "-c".to_string(), "sleep 30".to_string()],
            None,
        );
        let err = client.list_tools(200).await.unwrap_err();
        assert_eq!(err.code(), "Timeout");
        client.close().await;
    }
}
