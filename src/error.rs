//! Error taxonomy shared by every pipeline stage
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Which kind of record a lookup failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Deployment,
    Consumer,
    Tool,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::Consumer => "consumer",
            ResourceKind::Tool => "tool",
        })
    }
}

/// Rate limit window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Day,
}

/// One schema violation in tool arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// JSON pointer into the arguments ("" is the root)
    pub path: String,
    pub message: String,
}

/// Why an upstream attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamFault {
    #[error("origin responded with status {0}")]
    Status(u16),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("attempt timed out")]
    Timeout,
}

/// Failures reported by the store lookup interface.
///
/// Absence is not an error: lookups return `Ok(None)` for missing records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Recoverable fault; the cache retries the lookup once
    #[error("transient store fault: {0}")]
    Transient(String),
    #[error("store failure: {0}")]
    Backend(String),
}

/// Terminal failure of a request, rendered by the transport layer
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("rate limit exceeded for {window:?} window, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64, window: Window },

    #[error("tool arguments failed validation with {} violation(s)", violations.len())]
    Validation { violations: Vec<Violation> },

    #[error("upstream failed after {attempts_made} attempt(s): {last_fault}")]
    Upstream {
        attempts_made: u32,
        last_fault: UpstreamFault,
    },

    #[error("connection pool for {host} exhausted")]
    PoolExhausted { host: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),

    #[error("tool '{tool}' has an invalid input schema: {reason}")]
    InvalidToolSchema { tool: String, reason: String },

    #[error("request aborted: {0}")]
    Aborted(String),
}

impl GatewayError {
    /// Short machine readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MalformedRequest(_) => "malformed_request",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::PoolExhausted { .. } => "pool_exhausted",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::InvalidToolSchema { .. } => "invalid_tool_schema",
            GatewayError::Aborted(_) => "aborted",
        }
    }

    /// Logical HTTP status for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::NotFound { .. } => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Validation { .. } => 422,
            GatewayError::Upstream {
                last_fault: UpstreamFault::Timeout,
                ..
            } => 504,
            GatewayError::Upstream { .. } => 502,
            GatewayError::PoolExhausted { .. } | GatewayError::StoreUnavailable(_) => 503,
            GatewayError::InvalidToolSchema { .. } => 500,
            GatewayError::Aborted(_) => 499,
        }
    }

    /// Seconds for a `retry-after` header, rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }

    /// JSON body carrying the kind and the fields relevant to it
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            GatewayError::NotFound { kind, id } => {
                body["resource"] = json!(kind);
                body["id"] = json!(id);
            }
            GatewayError::RateLimited {
                retry_after_ms,
                window,
            } => {
                body["retryAfterMs"] = json!(retry_after_ms);
                body["window"] = json!(window);
            }
            GatewayError::Validation { violations } => {
                body["violations"] = json!(violations);
            }
            GatewayError::Upstream { attempts_made, .. } => {
                body["attemptsMade"] = json!(attempts_made);
            }
            _ => {}
        }
        body
    }
}
