use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    ReadOnly,
    Write,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CapabilityLevel {
    L0,
    L1,
    L2,
}

/// Metadata for one tool exposed through the catalog.
///
/// Names are dotted: `web.search`, `skill.python.run`, `mcp.<server>.<tool>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub name: String,
    pub input_schema: Value,
    pub provider_id: String,
    pub risk_level: RiskLevel,
    pub side_effects: bool,
    pub capability_level: CapabilityLevel,
    pub requires_confirm: bool,
    pub timeout_ms: u64,
}
