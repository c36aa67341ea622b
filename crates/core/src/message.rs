use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ErrorResponse;

/// Kind of a message travelling on the agent network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CapabilityRequest,
    CapabilityResponse,
    Error,
    /// Application-defined kind, handled by `on_custom`.
    Custom(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::CapabilityRequest => "capability_request",
            MessageKind::CapabilityResponse => "capability_response",
            MessageKind::Error => "error",
            MessageKind::Custom(kind) => kind.as_str(),
        }
    }

    /// Responses and errors both answer an earlier capability request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageKind::CapabilityResponse | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "capability_request" => MessageKind::CapabilityRequest,
            "capability_response" => MessageKind::CapabilityResponse,
            "error" => MessageKind::Error,
            other => MessageKind::Custom(other.to_string()),
        }
    }
}

/// Envelope passed between agents. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: String,
    from_agent: String,
    to_agent: Option<String>,
    kind: MessageKind,
    content: Value,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from_agent: &str,
        to_agent: Option<&str>,
        kind: MessageKind,
        content: Value,
        request_id: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.map(str::to_string),
            kind,
            content,
            request_id: request_id.to_string(),
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }

    pub fn broadcast(from_agent: &str, kind: MessageKind, content: Value, request_id: &str) -> Self {
        Self::new(from_agent, None, kind, content, request_id)
    }

    pub fn capability_request(
        from_agent: &str,
        to_agent: &str,
        capability: &str,
        data: Value,
        request_id: &str,
    ) -> Self {
        Self::new(
            from_agent,
            Some(to_agent),
            MessageKind::CapabilityRequest,
            json!({ "capability": capability, "data": data }),
            request_id,
        )
    }

    pub fn capability_response(
        from_agent: &str,
        to_agent: &str,
        result: Value,
        request_id: &str,
        reply_to: &str,
    ) -> Self {
        Self::new(
            from_agent,
            Some(to_agent),
            MessageKind::CapabilityResponse,
            result,
            request_id,
        )
        .with_reply_to(reply_to)
    }

    pub fn error(
        from_agent: &str,
        to_agent: &str,
        error: &ErrorResponse,
        request_id: &str,
        reply_to: Option<&str>,
    ) -> Self {
        let msg = Self::new(
            from_agent,
            Some(to_agent),
            MessageKind::Error,
            error.to_agent_content(),
            request_id,
        );
        match reply_to {
            Some(id) => msg.with_reply_to(id),
            None => msg,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_agent(&self) -> &str {
        &self.from_agent
    }

    pub fn to_agent(&self) -> Option<&str> {
        self.to_agent.as_deref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Capability named by a `capability_request` payload.
    pub fn capability(&self) -> Option<&str> {
        self.content.get("capability").and_then(|v| v.as_str())
    }

    /// Request data of a `capability_request` payload (`Null` when absent).
    pub fn data(&self) -> &Value {
        self.content.get("data").unwrap_or(&Value::Null)
    }

    /// Error payload for `error` messages.
    pub fn error_response(&self) -> Option<ErrorResponse> {
        match self.kind {
            MessageKind::Error => Some(ErrorResponse::from_content(&self.content)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_request_payload() {
        let msg = Message::capability_request(
            "nlu",
            "LightingAgent",
            "lights_on",
            json!({"room": "office"}),
            "req-1",
        );
        assert_eq!(msg.kind(), &MessageKind::CapabilityRequest);
        assert_eq!(msg.capability(), Some("lights_on"));
        assert_eq!(msg.data()["room"], "office");
        assert_eq!(msg.to_agent(), Some("LightingAgent"));
        assert!(!msg.is_broadcast());
        assert!(msg.reply_to().is_none());
    }

    #[test]
    fn test_response_links_original_message() {
        let req = Message::capability_request("a", "b", "get_schedule", Value::Null, "req-2");
        let resp = Message::capability_response("b", "a", json!({"events": []}), "req-2", req.id());
        assert_eq!(resp.reply_to(), Some(req.id()));
        assert_eq!(resp.request_id(), "req-2");
        assert!(resp.kind().is_reply());
        assert_ne!(resp.id(), req.id());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(MessageKind::from("error"), MessageKind::Error);
        assert_eq!(
            MessageKind::from("status_ping"),
            MessageKind::Custom("status_ping".to_string())
        );
        assert_eq!(MessageKind::Custom("status_ping".into()).to_string(), "status_ping");
    }

    #[test]
    fn test_error_message_payload() {
        let err = crate::Error::InvalidParameter("missing date".into()).to_response();
        let msg = Message::error("cal", "nlu", &err, "req-3", Some("m-1"));
        let back = msg.error_response().unwrap();
        assert_eq!(back.error_type, "InvalidParameterError");
        assert_eq!(back.message, "missing date");
        assert_eq!(msg.reply_to(), Some("m-1"));
    }
}
