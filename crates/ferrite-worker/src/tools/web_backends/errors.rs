use ferrite_types::ErrorCode;

/// Web search/fetch failures with contract-stable codes for
/// `step.error_code`.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// Empty query, max_results out of range, bad URL scheme.
    #[error("{0}")]
    InvalidInput(String),
    /// Backend raised something without its own code.
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    Timeout(String),
    /// 403/429/captcha or a page that says it is blocking us.
    /// `detail_code` is one of captcha_required, http_403, http_429.
    #[error("{message}")]
    Blocked {
        message: String,
        detail_code: Option<&'static str>,
    },
    /// Markup did not match or returned no parseable results.
    #[error("{0}")]
    Parse(String),
    /// DNS/connect failures.
    #[error("{0}")]
    Network(String),
    /// 401/403 or missing API key.
    #[error("{0}")]
    Auth(String),
    /// Upstream 5xx.
    #[error("{0}")]
    BadGateway(String),
    /// URL resolved to private/loopback/link-local space.
    #[error("{0}")]
    SsrfBlocked(String),
}

impl WebError {
    pub fn blocked(message: impl Into<String>, detail_code: Option<&'static str>) -> Self {
        WebError::Blocked {
            message: message.into(),
            detail_code,
        }
    }
}

impl ErrorCode for WebError {
    fn code(&self) -> &str {
        match self {
            WebError::InvalidInput(_) => "InvalidInput",
            WebError::Provider(_) => "WebProviderError",
            WebError::Timeout(_) => "Timeout",
            WebError::Blocked { .. } => "WebBlocked",
            WebError::Parse(_) => "WebParseError",
            WebError::Network(_) => "NetworkError",
            WebError::Auth(_) => "AuthError",
            WebError::BadGateway(_) => "BadGateway",
            WebError::SsrfBlocked(_) => "ssrf_blocked",
        }
    }

    fn detail_code(&self) -> Option<&str> {
        match self {
            WebError::Blocked { detail_code, .. } => *detail_code,
            _ => None,
        }
    }
}

pub(crate) fn clip(message: impl std::fmt::Display) -> String {
    message.to_string().chars().take(500).collect()
}
