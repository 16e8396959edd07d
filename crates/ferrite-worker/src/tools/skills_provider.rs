use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ferrite_providers::Llm;
use ferrite_types::{CapabilityLevel, ErrorCode, RiskLevel, ToolMeta};

use crate::tools::{InvokeScope, ToolError, ToolProvider};

pub const SKILL_TOOL_PREFIX: &str = "skill.";
const DEFAULT_SKILLS_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum SkillsError {
    /// `GET /skills` failed; message carries the base url and reason.
    #[error("GET {base_url}/skills failed: {reason}")]
    ListFailed { base_url: String, reason: String },
    /// Tool name is not in the currently listed skill set.
    #[error("unsupported skill: {0}")]
    Unsupported(String),
    /// `POST /skills/{id}/invoke` failed with a sandbox-shaped error code.
    #[error("{message}")]
    Invoke { code: String, message: String },
}

impl ErrorCode for SkillsError {
    fn code(&self) -> &str {
        match self {
            SkillsError::ListFailed { .. } => "SkillsListError",
            SkillsError::Unsupported(_) => "UNSUPPORTED_SKILL",
            SkillsError::Invoke { code, .. } => code,
        }
    }
}

fn skill_tool_name(skill_id: &str) -> String {
    format!("{SKILL_TOOL_PREFIX}{skill_id}")
}

fn skill_id_from_tool_name(tool_name: &str) -> Option<&str> {
    tool_name
        .strip_prefix(SKILL_TOOL_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

fn tool_meta_from_skill(skill: &Value) -> ToolMeta {
    let skill_id = skill.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
    let inputs = skill
        .pointer("/interface/inputs")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({"type": "object"}));
    let timeout_ms = skill
        .pointer("/limits/timeout_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_SKILLS_TIMEOUT_MS);
    ToolMeta {
        name: skill_tool_name(skill_id),
        input_schema: inputs,
        provider_id: SkillsProvider::PROVIDER_ID.to_string(),
        risk_level: RiskLevel::Write,
        side_effects: true,
        capability_level: CapabilityLevel::L2,
        requires_confirm: false,
        timeout_ms,
    }
}

/// Placeholder listing used only under the explicit fallback flag, so a
/// dead skills endpoint never silently hides every tool.
fn fallback_tool_metas() -> Vec<ToolMeta> {
    let mk = |skill_id: &str, schema: Value| ToolMeta {
        name: skill_tool_name(skill_id),
        input_schema: schema,
        provider_id: SkillsProvider::PROVIDER_ID.to_string(),
        risk_level: RiskLevel::Write,
        side_effects: true,
        capability_level: CapabilityLevel::L2,
        requires_confirm: false,
        timeout_ms: 60_000,
    };
    vec![
        mk(
            "python.run",
            json!({"type": "object", "properties": {"code": {"type": "string"}, "project_id": {"type": "string"}, "timeout_ms": {"type": "integer"}}}),
        ),
        mk(
            "shell.run",
            json!({"type": "object", "properties": {"script": {"type": "string"}, "project_id": {"type": "string"}, "timeout_ms": {"type": "integer"}}}),
        ),
    ]
}

/// Skills as tools: `list_tools` mirrors `GET /skills`, `invoke` posts to
/// `POST /skills/{id}/invoke`. Tool names are `skill.<id>`.
pub struct SkillsProvider {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    list_fallback: bool,
}

impl SkillsProvider {
    pub const PROVIDER_ID: &'static str = "skills";

    pub fn new(base_url: &str, list_fallback: bool) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
            list_fallback,
        }
    }

    async fn list_skills(&self) -> Result<Vec<Value>, SkillsError> {
        let response = self
            .client
            .get(format!("{}/skills", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SkillsError::ListFailed {
                base_url: self.base_url.clone(),
                reason: err.to_string(),
            })?;
        if response.status().as_u16() != 200 {
            return Err(SkillsError::ListFailed {
                base_url: self.base_url.clone(),
                reason: format!("HTTP {}", response.status().as_u16()),
            });
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| SkillsError::ListFailed {
                base_url: self.base_url.clone(),
                reason: err.to_string(),
            })
    }

    fn project_id_for(scope: &InvokeScope<'_>, args: &Value) -> String {
        if let Some(explicit) = args.get("project_id").and_then(|v| v.as_str()) {
            if !explicit.is_empty() {
                return explicit.to_string();
            }
        }
        scope
            .conversation_id
            .map(ToString::to_string)
            .unwrap_or_else(|| scope.run_id.to_string())
    }
}

#[async_trait]
impl ToolProvider for SkillsProvider {
    fn provider_id(&self) -> &str {
        Self::PROVIDER_ID
    }

    async fn list_tools(&self) -> Result<Vec<ToolMeta>, ToolError> {
        match self.list_skills().await {
            Ok(skills) => Ok(skills.iter().map(tool_meta_from_skill).collect()),
            Err(err) if self.list_fallback => {
                tracing::warn!(error = %err, "skills list_tools failed (fallback enabled)");
                Ok(fallback_tool_metas())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        scope: InvokeScope<'_>,
        _llm: Option<&dyn Llm>,
    ) -> Result<Value, ToolError> {
        let Some(skill_id) = skill_id_from_tool_name(tool_name) else {
            return Err(ToolError::not_found(tool_name, "not a skill tool"));
        };
        // Re-validate against the live listing; a vanished endpoint raises
        // the typed list error rather than a 404 from the POST below.
        let listed = match self.list_skills().await {
            Ok(skills) => skills
                .iter()
                .any(|s| s.get("id").and_then(|v| v.as_str()) == Some(skill_id)),
            Err(err) if self.list_fallback => {
                tracing::warn!(error = %err, "skills listing failed during invoke (fallback enabled)");
                matches!(skill_id, "python.run" | "shell.run")
            }
            Err(err) => return Err(err.into()),
        };
        if !listed {
            return Err(SkillsError::Unsupported(skill_id.to_string()).into());
        }

        let mut body = args.clone();
        if !body.is_object() {
            body = json!({});
        }
        body["project_id"] = json!(Self::project_id_for(&scope, args));

        let response = self
            .client
            .post(format!("{}/skills/{}/invoke", self.base_url, skill_id))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SkillsError::Invoke {
                code: "NetworkError".to_string(),
                message: err.to_string(),
            })?;
        let status = response.status().as_u16();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if status != 200 {
            let code = payload
                .pointer("/error_reason/code")
                .or_else(|| payload.pointer("/detail/code"))
                .and_then(|v| v.as_str())
                .unwrap_or("SkillInvokeError")
                .to_string();
            let message = payload
                .pointer("/error_reason/message")
                .or_else(|| payload.pointer("/detail/message"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(SkillsError::Invoke { code, message }.into());
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_prefixed_and_parsed() {
        assert_eq!(skill_tool_name("python.run"), "skill.python.run");
        assert_eq!(skill_id_from_tool_name("skill.shell.run"), Some("shell.run"));
        assert_eq!(skill_id_from_tool_name("web.search"), None);
        assert_eq!(skill_id_from_tool_name("skill."), None);
    }

    #[test]
    fn meta_from_skill_uses_manifest_limits() {
        let skill = json!({
            "id": "python.run",
            "name": "Run Python",
            "interface": {"inputs": {"type": "object", "properties": {"code": {"type": "string"}}}},
            "limits": {"timeout_ms": 45000},
        });
        let meta = tool_meta_from_skill(&skill);
        assert_eq!(meta.name, "skill.python.run");
        assert_eq!(meta.timeout_ms, 45_000);
        assert_eq!(meta.capability_level, CapabilityLevel::L2);
        assert_eq!(meta.risk_level, RiskLevel::Write);
        assert!(meta.side_effects);
    }

    #[test]
    fn malformed_interface_degrades_to_object_schema() {
        let skill = json!({"id": "x.run", "interface": {"inputs": [1, 2]}});
        let meta = tool_meta_from_skill(&skill);
        assert_eq!(meta.input_schema, json!({"type": "object"}));
        assert_eq!(meta.timeout_ms, DEFAULT_SKILLS_TIMEOUT_MS);
    }

    #[test]
    fn fallback_metas_cover_python_and_shell() {
        let metas = fallback_tool_metas();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["skill.python.run", "skill.shell.run"]);
    }

    #[test]
    fn list_error_code_is_stable() {
        let err = SkillsError::ListFailed {
            base_url: "http://core:5173".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.code(), "SkillsListError");
        assert!(err.to_string().contains("http://core:5173"));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(SkillsError::Unsupported("x".into()).code(), "UNSUPPORTED_SKILL");
    }

    #[tokio::test]
    async fn dead_endpoint_without_fallback_raises_list_error() {
        let provider = SkillsProvider::new("http://127.0.0.1:1", false);
        let err = provider.list_tools().await.unwrap_err();
        assert_eq!(err.code(), "SkillsListError");
    }

    #[tokio::test]
    async fn dead_endpoint_with_fallback_lists_placeholders() {
        let provider = SkillsProvider::new("http://127.0.0.1:1", true);
        let tools = provider.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
    }
}
