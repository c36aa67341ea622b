use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// External dependency down, rate-limited, or circuit open.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        /// Suggested wait before retrying, in seconds.
        retry_after: Option<u64>,
        /// Last HTTP status seen, when the failure came from a status code.
        status: Option<u16>,
        /// Number of attempts made before giving up.
        attempts: Option<u32>,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        attempts: Option<u32>,
    },

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Protocol execution failed: {0}")]
    ProtocolExecution(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
            retry_after,
            status: None,
            attempts: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout {
            message: message.into(),
            attempts: None,
        }
    }

    /// Stable name of the error kind, used in `error` messages between agents.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::ServiceUnavailable { .. } => "ServiceUnavailableError",
            Error::InvalidParameter(_) => "InvalidParameterError",
            Error::Authentication(_) => "AuthenticationError",
            Error::Timeout { .. } => "TimeoutError",
            Error::CapabilityNotFound(_) => "CapabilityNotFoundError",
            Error::ProtocolExecution(_) => "ProtocolExecutionError",
            Error::Config(_) => "ConfigurationError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Network(_) => "NetworkError",
            Error::Agent(_) => "AgentError",
            Error::Other(_) => "AgentError",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether a caller may reasonably try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ServiceUnavailable { .. } | Error::Timeout { .. } | Error::Network(_)
        )
    }

    pub fn to_response(&self) -> ErrorResponse {
        let mut details = Map::new();
        match self {
            Error::ServiceUnavailable {
                status, attempts, ..
            } => {
                if let Some(status) = status {
                    details.insert("status_code".to_string(), json!(status));
                }
                if let Some(attempts) = attempts {
                    details.insert("attempts".to_string(), json!(attempts));
                }
            }
            Error::Timeout {
                attempts: Some(attempts),
                ..
            } => {
                details.insert("attempts".to_string(), json!(attempts));
            }
            _ => {}
        }

        let message = match self {
            Error::ServiceUnavailable { message, .. } | Error::Timeout { message, .. } => {
                message.clone()
            }
            Error::InvalidParameter(m)
            | Error::Authentication(m)
            | Error::CapabilityNotFound(m)
            | Error::ProtocolExecution(m)
            | Error::Config(m)
            | Error::Network(m)
            | Error::Agent(m)
            | Error::Other(m) => m.clone(),
            other => other.to_string(),
        };

        ErrorResponse {
            error_type: self.error_type().to_string(),
            message,
            details: if details.is_empty() {
                None
            } else {
                Some(Value::Object(details))
            },
            retry_after: self.retry_after(),
        }
    }
}

/// Serializable error payload carried by `error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    /// Content of an `error` message. The `error` key is what receivers read first.
    pub fn to_agent_content(&self) -> Value {
        json!({
            "error": self.message,
            "error_type": self.error_type,
            "details": self.details,
            "retry_after": self.retry_after,
        })
    }

    /// Recover an error payload from message content, accepting bare `{"error": "..."}` maps.
    pub fn from_content(content: &Value) -> Self {
        let message = content
            .get("error")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string());
        let error_type = content
            .get("error_type")
            .and_then(|v| v.as_str())
            .unwrap_or("AgentError")
            .to_string();
        Self {
            error_type,
            message,
            details: content.get("details").filter(|d| !d.is_null()).cloned(),
            retry_after: content.get("retry_after").and_then(|v| v.as_u64()),
        }
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        err.to_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_unavailable_response_carries_details() {
        let err = Error::ServiceUnavailable {
            message: "weather api returned 503".to_string(),
            retry_after: Some(30),
            status: Some(503),
            attempts: Some(4),
        };
        let resp = err.to_response();
        assert_eq!(resp.error_type, "ServiceUnavailableError");
        assert_eq!(resp.message, "weather api returned 503");
        assert_eq!(resp.retry_after, Some(30));
        let details = resp.details.unwrap();
        assert_eq!(details["status_code"], 503);
        assert_eq!(details["attempts"], 4);
    }

    #[test]
    fn test_agent_content_round_trip() {
        let err = Error::CapabilityNotFound("lights_on".to_string());
        let content = err.to_response().to_agent_content();
        assert_eq!(content["error"], "lights_on");
        let back = ErrorResponse::from_content(&content);
        assert_eq!(back.error_type, "CapabilityNotFoundError");
        assert_eq!(back.message, "lights_on");
        assert!(back.details.is_none());
    }

    #[test]
    fn test_from_bare_error_map() {
        let back = ErrorResponse::from_content(&json!({"error": "boom"}));
        assert_eq!(back.error_type, "AgentError");
        assert_eq!(back.message, "boom");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::timeout("slow").is_retryable());
        assert!(Error::service_unavailable("down", Some(5)).is_retryable());
        assert!(!Error::InvalidParameter("bad date".into()).is_retryable());
        assert!(!Error::Authentication("expired token".into()).is_retryable());
    }
}
