mod health;
mod path_adapter;
mod policy;
mod runner;

pub use health::sandbox_health;
pub use path_adapter::{detect_runtime, HostPathAdapter, RuntimeMode};
pub use policy::{merge_policy, SandboxPolicy};
pub use runner::{
    validate_exec_kind_command, validate_input_path, ExecInput, ExecRequest, ExecResponse,
    ExecStatus, SandboxRunner,
};

/// Sandbox failures carry a stable code and map 1:1 onto HTTP statuses at
/// the skill-invoke endpoint (403/400/500/500).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("{0}")]
    PolicyDenied(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Timeout(String),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::PolicyDenied(_) => "POLICY_DENIED",
            SandboxError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SandboxError::Runtime(_) => "RUNTIME_ERROR",
            SandboxError::Timeout(_) => "TIMEOUT",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            SandboxError::PolicyDenied(_) => 403,
            SandboxError::InvalidArgument(_) => 400,
            SandboxError::Runtime(_) | SandboxError::Timeout(_) => 500,
        }
    }

    pub fn to_reason(&self) -> serde_json::Value {
        serde_json::json!({"code": self.code(), "message": self.to_string()})
    }
}
