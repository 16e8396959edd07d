pub mod error;
pub mod facts;
pub mod run;
pub mod task_result;
pub mod tool;

pub use error::{ErrorCode, TaskError};
pub use facts::Fact;
pub use run::{Run, RunCreate, RunStatus};
pub use task_result::{StepRecord, TaskResult, TASK_RESULT_VERSION};
pub use tool::{CapabilityLevel, RiskLevel, ToolMeta};

/// Returns true when `raw` is a 32-char lowercase hex trace id.
pub fn is_valid_trace_id(raw: Option<&str>) -> bool {
    match raw {
        Some(s) => s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

/// Fresh 32-hex trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_validation() {
        assert!(is_valid_trace_id(Some("a".repeat(32).as_str())));
        assert!(is_valid_trace_id(Some(new_trace_id().as_str())));
        assert!(!is_valid_trace_id(Some("short")));
        assert!(!is_valid_trace_id(Some("Z".repeat(32).as_str())));
        assert!(!is_valid_trace_id(Some("A".repeat(32).as_str())));
        assert!(!is_valid_trace_id(None));
    }
}
