pub mod stdio;

use async_trait::async_trait;
use serde_json::{json, Value};

use ferrite_providers::Llm;
use ferrite_types::{CapabilityLevel, ErrorCode, RiskLevel, ToolMeta};

use crate::tools::{InvokeScope, ToolError, ToolProvider};

pub use stdio::McpStdioClient;

pub const MCP_TOOL_PREFIX: &str = "mcp.";
pub const DEFAULT_MCP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP spawn failed{}", fmt_detail(.0))]
    SpawnFailed(String),
    #[error("MCP request timeout{}", fmt_detail(.0))]
    Timeout(String),
    #[error("MCP connection error{}", fmt_detail(.0))]
    Connection(String),
    #[error("MCPProvider is closed{}", fmt_detail(.0))]
    ProviderClosed(String),
}

fn fmt_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(" ({detail})")
    }
}

impl ErrorCode for McpError {
    fn code(&self) -> &str {
        match self {
            McpError::SpawnFailed(_) => "SpawnFailed",
            McpError::Timeout(_) => "Timeout",
            McpError::Connection(_) => "ConnectionError",
            McpError::ProviderClosed(_) => "ProviderClosed",
        }
    }
}

fn mcp_tool_name(server_name: &str, raw_name: &str) -> String {
    format!("{MCP_TOOL_PREFIX}{server_name}.{raw_name}")
}

fn strip_mcp_prefix<'a>(server_name: &str, prefixed: &'a str) -> Option<&'a str> {
    prefixed
        .strip_prefix(MCP_TOOL_PREFIX)?
        .strip_prefix(server_name)?
        .strip_prefix('.')
}

fn tool_meta_from_mcp(server_name: &str, provider_id: &str, raw: &Value) -> ToolMeta {
    let raw_name = raw.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
    let input_schema = raw
        .get("inputSchema")
        .or_else(|| raw.get("input_schema"))
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({"type": "object"}));
    let side_effects = raw
        .get("side_effects")
        .or_else(|| raw.get("sideEffects"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    ToolMeta {
        name: mcp_tool_name(server_name, raw_name),
        input_schema,
        provider_id: provider_id.to_string(),
        risk_level: RiskLevel::Unknown,
        side_effects,
        capability_level: CapabilityLevel::L0,
        requires_confirm: side_effects,
        timeout_ms: raw
            .get("timeout_ms")
            .or_else(|| raw.get("timeoutMs"))
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MCP_TIMEOUT_MS),
    }
}

/// Normalize an MCP `tools/call` result: dicts pass through, content lists
/// get their text concatenated for preview friendliness.
fn normalize_call_result(result: Value) -> Value {
    if let Some(content) = result.get("content").and_then(|v| v.as_array()) {
        let texts: Vec<&str> = content
            .iter()
            .filter(|c| c.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            let mut out = result.clone();
            out["text"] = json!(texts.join("\n"));
            return out;
        }
    }
    if result.is_object() {
        result
    } else {
        json!({"result": result})
    }
}

/// One MCP server as a tool provider. Tool names are forcibly namespaced
/// `mcp.<server>.<tool>`; `list_tools` never raises (degrades to empty with
/// a log line); `close` is idempotent.
pub struct McpProvider {
    server_name: String,
    provider_id: String,
    client: McpStdioClient,
}

impl McpProvider {
    pub fn new(server_name: &str, cmd: Vec<String>, cwd: Option<String>) -> Self {
        Self {
            server_name: server_name.to_string(),
            provider_id: format!("mcp_{server_name}"),
            client: McpStdioClient::new(cmd, cwd),
        }
    }
}

#[async_trait]
impl ToolProvider for McpProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError> {
        match self.client.list_tools(DEFAULT_MCP_TIMEOUT_MS).await {
            Ok(raw_tools) => Ok(raw_tools
                .iter()
                .filter(|raw| raw.get("name").and_then(|v| v.as_str()).is_some())
                .map(|raw| tool_meta_from_mcp(&self.server_name, &self.provider_id, raw))
                .collect()),
            Err(err) => {
                tracing::warn!(
                    server_name = %self.server_name,
                    error = %err,
                    "mcp.list_tools.failed"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        _scope: InvokeScope<'_>,
        _llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        let Some(raw_name) = strip_mcp_prefix(&self.server_name, tool_name) else {
            return Err(ToolError::not_found(
                tool_name,
                "tool name not from this MCP server",
            ));
        };
        let result = self
            .client
            .call_tool(raw_name, args.clone(), DEFAULT_MCP_TIMEOUT_MS)
            .await?;
        Ok(normalize_call_result(result))
    }

    async fn close(&self) {
        self.client.close().await;
    }
}
