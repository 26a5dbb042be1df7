use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error conditions surfaced by the Danbooru API and the transport under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401
    Authentication,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 410, Danbooru refuses deep pagination.
    PaginationLimit,
    /// 400, 420 (invalid record), 424 (invalid parameters) and local argument errors.
    Validation,
    /// 422
    ResourceLocked,
    /// 423
    ResourceExists,
    /// 429
    RateLimited,
    /// 500 and unlisted 5xx codes.
    Server,
    /// 502 / 503
    ServiceUnavailable,
    /// Any other status at or above 400.
    Api,
    /// DNS, connect, reset, timeout.
    Network,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::PaginationLimit => "pagination_limit",
            Self::Validation => "validation",
            Self::ResourceLocked => "resource_locked",
            Self::ResourceExists => "resource_exists",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Api => "api",
            Self::Network => "network",
        }
    }

    /// Kinds the client retries locally before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server | Self::ServiceUnavailable | Self::Network
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication => ErrorCategory::Auth,
            Self::RateLimited => ErrorCategory::RateLimit,
            Self::Validation => ErrorCategory::Validation,
            Self::Network => ErrorCategory::Network,
            _ => ErrorCategory::Api,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping attached to diagnostic error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Validation,
    Api,
    Network,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Api => "api",
            Self::Network => "network",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}", render(.status, .message))]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub response_data: Option<Value>,
}

fn render(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("[{}] {}", code, message),
        None => message.to_string(),
    }
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            response_data: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_response_data(mut self, data: Option<Value>) -> Self {
        self.response_data = data;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::network(format!("network request failed: {}", e))
    }
}

/// Map an HTTP status to its error kind. Codes below 400 are not errors.
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    let kind = match status {
        0..=399 => return None,
        400 | 420 | 424 => ErrorKind::Validation,
        401 => ErrorKind::Authentication,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        410 => ErrorKind::PaginationLimit,
        422 => ErrorKind::ResourceLocked,
        423 => ErrorKind::ResourceExists,
        429 => ErrorKind::RateLimited,
        502 | 503 => ErrorKind::ServiceUnavailable,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Api,
    };
    Some(kind)
}

fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Authentication => "Authentication failed",
        ErrorKind::Forbidden => "Access denied",
        ErrorKind::NotFound => "Resource not found",
        ErrorKind::PaginationLimit => "Pagination limit exceeded",
        ErrorKind::Validation => "Validation failed",
        ErrorKind::ResourceLocked => "Resource is locked",
        ErrorKind::ResourceExists => "Resource already exists",
        ErrorKind::RateLimited => "Rate limit exceeded",
        ErrorKind::Server => "Internal server error",
        ErrorKind::ServiceUnavailable => "Service temporarily unavailable",
        ErrorKind::Api | ErrorKind::Network => "API error",
    }
}

/// Fail with the typed error for `status`, or pass when it is a success code.
pub fn error_for_status(
    status: u16,
    message: &str,
    response_data: Option<Value>,
    retry_after: Option<Duration>,
) -> Result<(), ApiError> {
    let Some(kind) = kind_for_status(status) else {
        return Ok(());
    };
    let message = if message.trim().is_empty() {
        default_message(kind).to_string()
    } else {
        message.to_string()
    };
    let retry_after = if kind == ErrorKind::RateLimited {
        retry_after
    } else {
        None
    };
    Err(ApiError::new(kind, message)
        .with_status(status)
        .with_retry_after(retry_after)
        .with_response_data(response_data))
}

/// Failures of the host key/value store backing subscriptions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value store failure: {0}")]
    Backend(String),

    #[error("stored record is malformed")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to access state file")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by subscription commands and dispatch cycles.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("subscriptions are disabled")]
    Disabled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is not valid JSON")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}
