pub mod builtin;
pub mod catalog;
pub mod mcp;
pub mod runtime;
pub mod skills_provider;
pub mod web_backends;
pub mod web_provider;
pub mod webfetch;

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use ferrite_providers::Llm;
use ferrite_types::{ErrorCode, ToolMeta};

pub use catalog::{build_catalog_from_settings, ToolCatalog};
pub use runtime::ToolRuntime;

use self::mcp::McpError;
use self::skills_provider::SkillsError;
use self::web_backends::WebError;

/// Ambient info a provider may need during one invocation. Deliberately
/// narrower than the task context so providers cannot touch step state.
#[derive(Clone, Copy)]
pub struct InvokeScope<'a> {
    pub run_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub artifact_dir: Option<&'a Path>,
}

/// A group of tools sharing one implementation. The catalog aggregates
/// providers by its preferred order.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError>;

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        scope: InvokeScope<'_>,
        llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError>;

    /// Release provider-owned resources (subprocesses, reader tasks).
    /// Must be idempotent.
    async fn close(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name} ({reason})")]
    NotFound { name: String, reason: String },
    #[error(transparent)]
    Web(#[from] WebError),
    #[error(transparent)]
    Skills(#[from] SkillsError),
    #[error(transparent)]
    Mcp(#[from] McpError),
    #[error("{0}")]
    Other(String),
}

impl ToolError {
    pub fn not_found(name: &str, reason: &str) -> Self {
        ToolError::NotFound {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ErrorCode for ToolError {
    fn code(&self) -> &str {
        match self {
            ToolError::NotFound { .. } => "ToolNotFound",
            ToolError::Web(err) => err.code(),
            ToolError::Skills(err) => err.code(),
            ToolError::Mcp(err) => err.code(),
            ToolError::Other(_) => "ToolError",
        }
    }

    fn detail_code(&self) -> Option<&str> {
        match self {
            ToolError::Web(err) => err.detail_code(),
            _ => None,
        }
    }
}
