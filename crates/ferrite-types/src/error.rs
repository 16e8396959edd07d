use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error code carried by anything that can fail inside a step.
///
/// The step machinery reads the code explicitly; there is no downcasting or
/// type-name introspection on the failure path.
pub trait ErrorCode {
    fn code(&self) -> &str;
    fn detail_code(&self) -> Option<&str> {
        None
    }
}

/// Top-level task error as stored in the `task_result_v0` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub step: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}

impl ErrorCode for TaskError {
    fn code(&self) -> &str {
        &self.code
    }
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            step: step.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_and_code() {
        let err = TaskError::new("Timeout", "request timeout", "tool.web.fetch");
        assert_eq!(err.code(), "Timeout");
        assert_eq!(err.to_string(), "Timeout: request timeout");
        assert!(!err.retryable);
    }
}
