use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One user-scoped knowledge entry. The active set is the `status == "active"`
/// subset merged by key with precedence session > project > global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub key: String,
    pub value: Value,
    pub status: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.status == "active" && !self.key.is_empty()
    }
}
